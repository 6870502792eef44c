//! AuthService behavior with a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use authbridge_core::headers::{CHALLENGE_HEADER, CHALLENGE_RESPONSE_HEADER, SIGN_IN_HEADER};
use authbridge_core::mock::{MockSigner, RecordingObserver};
use authbridge_core::{
    AuthConfig, AuthEffect, AuthEvent, AuthHandle, AuthParams, AuthService, Authenticator,
    BridgeError, Header, Request, Response,
};
use serde_json::json;

const GAIA: &str = "https://accounts.example.com/";
const GAIA_ORIGIN: &str = "https://accounts.example.com";
const IDP_LOGIN: &str = "https://idp.example.org/sso/login";

fn start(signer: MockSigner, observer: Arc<RecordingObserver>) -> AuthHandle {
    let authenticator = Authenticator::new(AuthConfig {
        done_wait_timeout: Duration::from_millis(500),
        allowed_origins: vec![GAIA_ORIGIN.into()],
        ..Default::default()
    })
    .expect("valid config");
    AuthService::new(authenticator, Arc::new(signer))
        .with_observer(observer)
        .start()
}

/// Let spawned tasks run until they block again.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_done_timeout_synthesizes_missing_signals() {
    let observer = Arc::new(RecordingObserver::default());
    let handle = start(MockSigner::default(), observer.clone());

    handle
        .dispatch(AuthEvent::Load {
            params: AuthParams::new(GAIA),
        })
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::HeadersReceived(
            Response::new(GAIA, 200).with_header(
                SIGN_IN_HEADER,
                r#"email="jane@example.com", obfuscatedid="77", sessionindex=1"#,
            ),
        ))
        .await
        .unwrap();
    let effects = handle
        .dispatch(AuthEvent::LoadCommit {
            url: GAIA.into(),
            is_top_level: true,
        })
        .await
        .unwrap();
    assert!(effects.contains(&AuthEffect::ArmDoneTimer {
        generation: 1,
        delay_ms: 500
    }));

    tokio::time::sleep(Duration::from_millis(499)).await;
    settle().await;
    assert!(observer.take().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;
    // Old IdPs never send userInfo or closeView; the timer stands in for both.
    assert_eq!(
        observer.take(),
        vec![AuthEffect::RequestPassword {
            email: "jane@example.com".into()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_all_signals_cancel_the_timer() {
    let observer = Arc::new(RecordingObserver::default());
    let handle = start(MockSigner::default(), observer.clone());

    handle
        .dispatch(AuthEvent::Load {
            params: AuthParams::new(GAIA),
        })
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::HeadersReceived(
            Response::new(GAIA, 200).with_header(
                SIGN_IN_HEADER,
                r#"email="jane@example.com", obfuscatedid="77", sessionindex=1"#,
            ),
        ))
        .await
        .unwrap();
    for message in [
        json!({"method": "userInfo", "services": []}),
        json!({"method": "closeView"}),
    ] {
        handle
            .dispatch(AuthEvent::PageMessage {
                origin: GAIA_ORIGIN.into(),
                message,
            })
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert!(observer.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_signer_result_replays_with_response_header() {
    let observer = Arc::new(RecordingObserver::default());
    let handle = start(MockSigner::delayed(Duration::from_millis(50)), observer.clone());

    handle
        .dispatch(AuthEvent::Load {
            params: AuthParams::new(GAIA),
        })
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::HeadersReceived(
            Response::new(IDP_LOGIN, 302).with_header(CHALLENGE_HEADER, "n0nce"),
        ))
        .await
        .unwrap();
    let effects = handle
        .dispatch(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)))
        .await
        .unwrap();
    assert!(effects
        .iter()
        .any(|e| matches!(e, AuthEffect::ComputeAttestation { cycle: 1, .. })));

    tokio::time::sleep(Duration::from_millis(60)).await;
    settle().await;
    assert_eq!(
        observer.take(),
        vec![AuthEffect::Navigate {
            url: IDP_LOGIN.into()
        }]
    );

    handle
        .dispatch(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)))
        .await
        .unwrap();
    let effects = handle
        .dispatch(AuthEvent::BeforeSendHeaders {
            url: IDP_LOGIN.into(),
            main_frame: true,
        })
        .await
        .unwrap();
    assert_eq!(
        effects,
        vec![AuthEffect::AddRequestHeader {
            url: IDP_LOGIN.into(),
            header: Header::new(CHALLENGE_RESPONSE_HEADER, MockSigner::response_for("n0nce")),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_signer_result_after_reset_is_discarded() {
    let observer = Arc::new(RecordingObserver::default());
    let handle = start(MockSigner::delayed(Duration::from_millis(50)), observer.clone());

    handle
        .dispatch(AuthEvent::Load {
            params: AuthParams::new(GAIA),
        })
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::HeadersReceived(
            Response::new(IDP_LOGIN, 302).with_header(CHALLENGE_HEADER, "n0nce"),
        ))
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)))
        .await
        .unwrap();
    handle.dispatch(AuthEvent::Reset).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    settle().await;
    assert!(observer.take().is_empty());

    // The next navigation is not held up by the abandoned cycle.
    let effects = handle
        .dispatch(AuthEvent::BeforeSendHeaders {
            url: IDP_LOGIN.into(),
            main_frame: true,
        })
        .await
        .unwrap();
    assert!(effects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_signature_still_replays() {
    let observer = Arc::new(RecordingObserver::default());
    let handle = start(MockSigner::failing(), observer.clone());

    handle
        .dispatch(AuthEvent::Load {
            params: AuthParams::new(GAIA),
        })
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::HeadersReceived(
            Response::new(IDP_LOGIN, 307).with_header(CHALLENGE_HEADER, "n0nce"),
        ))
        .await
        .unwrap();
    handle
        .dispatch(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)))
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        observer.take(),
        vec![AuthEffect::Navigate {
            url: IDP_LOGIN.into()
        }]
    );
}

#[tokio::test]
async fn test_handle_reports_stopped_service() {
    let handle = start(MockSigner::default(), Arc::new(RecordingObserver::default()));
    assert!(handle.is_running());
    handle.shutdown().await.unwrap();
    settle().await;

    assert!(!handle.is_running());
    assert!(matches!(
        handle.dispatch(AuthEvent::Reload).await,
        Err(BridgeError::ServiceStopped)
    ));
}
