//! End-to-end flows through the sans-IO authenticator, plus property tests
//! for the quantified guarantees of the protocol pieces.

use std::sync::{Arc, Mutex};

use authbridge_core::attestation::Stage;
use authbridge_core::channel::{Channel, Reply, INTERNAL_REPLY};
use authbridge_core::config::KEY_TYPE_PASSWORD_PLAIN;
use authbridge_core::headers::{
    CHALLENGE_HEADER, CHALLENGE_RESPONSE_HEADER, SAML_HEADER, SIGN_IN_HEADER,
};
use authbridge_core::session::{FieldKey, PasswordStore};
use authbridge_core::{
    AttestationOutcome, AuthCompletedCredentials, AuthConfig, AuthEffect, AuthEvent, AuthFlow,
    AuthParams, Authenticator, ChannelId, CredentialApi, Frame, Header, InjectedMessage, Request,
    Response, Secret, TransportAnomaly,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const GAIA: &str = "https://accounts.example.com/";
const GAIA_ORIGIN: &str = "https://accounts.example.com";
const IDP_ORIGIN: &str = "https://idp.example.org";
const IDP_LOGIN: &str = "https://idp.example.org/sso/login";
const SIGN_IN: &str = r#"email="jane@example.com", obfuscatedid="1029384756", sessionindex=0"#;

fn authenticator() -> Authenticator {
    Authenticator::new(AuthConfig {
        allowed_origins: vec![GAIA_ORIGIN.into(), IDP_ORIGIN.into()],
        ..Default::default()
    })
    .expect("valid config")
}

fn completions(effects: &[AuthEffect]) -> Vec<&AuthCompletedCredentials> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            AuthEffect::Completed { credentials } => Some(credentials.as_ref()),
            _ => None,
        })
        .collect()
}

/// Opens a channel from `origin` and posts plain messages on it.
struct InjectedScript {
    origin: &'static str,
    channel_id: ChannelId,
}

impl InjectedScript {
    fn connect(auth: &mut Authenticator, origin: &'static str, name: &str) -> Self {
        let channel_id = ChannelId::generate();
        auth.handle(AuthEvent::TransportFrame {
            origin: origin.into(),
            frame: Frame::Connect {
                channel_id,
                name: name.into(),
            }
            .encode(),
        });
        Self { origin, channel_id }
    }

    fn post(&self, auth: &mut Authenticator, payload: Value) -> Vec<AuthEffect> {
        auth.handle(AuthEvent::TransportFrame {
            origin: self.origin.into(),
            frame: Frame::Message {
                channel_id: self.channel_id,
                payload,
            }
            .encode(),
        })
    }
}

#[test]
fn test_saml_round_trip_completes_once_with_scraped_password() {
    let mut auth = authenticator();
    let mut effects = auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });

    // Host redirects into the IdP.
    effects.extend(auth.handle(AuthEvent::HeadersReceived(
        Response::new(IDP_LOGIN, 200).with_header(SAML_HEADER, "start"),
    )));
    // Nothing changes until the IdP page actually commits.
    assert!(!auth.saml().is_saml_page());
    effects.extend(auth.handle(AuthEvent::LoadCommit {
        url: IDP_LOGIN.into(),
        is_top_level: true,
    }));
    assert!(auth.saml().is_saml_page());
    assert_eq!(auth.session().auth_flow, AuthFlow::Saml);

    let scraper = InjectedScript::connect(&mut auth, IDP_ORIGIN, "injected");
    scraper.post(
        &mut auth,
        json!({"name": "updatePassword", "url": IDP_LOGIN, "index": 0, "id": "pw", "password": "correct horse"}),
    );
    assert_eq!(auth.saml().scraped_password_count(), 1);

    // IdP posts back to the host, which identifies the user.
    effects.extend(auth.handle(AuthEvent::HeadersReceived(
        Response::new(format!("{GAIA}signin/saml"), 302)
            .with_header(SAML_HEADER, "end")
            .with_header(SIGN_IN_HEADER, SIGN_IN),
    )));
    effects.extend(auth.handle(AuthEvent::LoadCommit {
        url: format!("{GAIA}signin/saml"),
        is_top_level: true,
    }));
    assert!(!auth.saml().is_saml_page());

    for message in [
        json!({"method": "userInfo", "services": ["gmail"]}),
        json!({"method": "closeView"}),
    ] {
        effects.extend(auth.handle(AuthEvent::PageMessage {
            origin: GAIA_ORIGIN.into(),
            message,
        }));
    }

    // Late duplicates of every signal change nothing.
    effects.extend(auth.handle(AuthEvent::PageMessage {
        origin: GAIA_ORIGIN.into(),
        message: json!({"method": "closeView"}),
    }));
    effects.extend(auth.handle(AuthEvent::DoneTimeout { generation: 1 }));
    effects.extend(auth.handle(AuthEvent::LoadCommit {
        url: GAIA.into(),
        is_top_level: true,
    }));

    let completed = completions(&effects);
    assert_eq!(completed.len(), 1);
    let credentials = completed[0];
    assert!(credentials.using_saml);
    assert_eq!(credentials.password.expose(), "correct horse");
    assert_eq!(credentials.scraped_saml_passwords, vec![Secret::new("correct horse")]);
    assert_eq!(credentials.email, "jane@example.com");
    assert_eq!(credentials.gaia_id, "1029384756");
    assert_eq!(credentials.services, vec!["gmail".to_string()]);
    assert!(credentials.trusted);
    assert!(effects.contains(&AuthEffect::OnePasswordScraped));
    assert!(effects.contains(&AuthEffect::CancelDoneTimer { generation: 1 }));
}

#[test]
fn test_credential_api_password_beats_scraping() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA).starting_on_saml_page(),
    });
    auth.handle(AuthEvent::LoadCommit {
        url: IDP_LOGIN.into(),
        is_top_level: true,
    });

    let scraper = InjectedScript::connect(&mut auth, IDP_ORIGIN, "injected");
    scraper.post(
        &mut auth,
        json!({"name": "updatePassword", "url": IDP_LOGIN, "index": 0, "id": "pw", "password": "scraped"}),
    );

    let api = InjectedScript::connect(&mut auth, IDP_ORIGIN, "credentials");
    let mut effects = Vec::new();
    for call in [
        json!({"method": "initialize", "requestedVersion": 1}),
        json!({"method": "add", "token": "tok", "keyType": KEY_TYPE_PASSWORD_PLAIN, "passwordBytes": "from-api"}),
        json!({"method": "confirm", "token": "tok"}),
    ] {
        effects.extend(api.post(&mut auth, json!({"name": "apiCall", "call": call})));
    }
    assert!(effects.contains(&AuthEffect::ApiPasswordAdded));
    assert!(!auth.coordinator().waiting_for_api_confirm());

    auth.handle(AuthEvent::HeadersReceived(
        Response::new(GAIA, 200).with_header(SIGN_IN_HEADER, SIGN_IN),
    ));
    auth.handle(AuthEvent::PageMessage {
        origin: GAIA_ORIGIN.into(),
        message: json!({"method": "userInfo", "services": []}),
    });
    let effects = auth.handle(AuthEvent::PageMessage {
        origin: GAIA_ORIGIN.into(),
        message: json!({"method": "closeView"}),
    });

    let completed = completions(&effects);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].password.expose(), "from-api");
    // API flows do not leak scraped values.
    assert!(completed[0].scraped_saml_passwords.is_empty());
}

#[test]
fn test_disallowed_origin_cannot_open_channels() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA).starting_on_saml_page(),
    });
    let rogue = InjectedScript::connect(&mut auth, "https://evil.example.net", "injected");
    rogue.post(
        &mut auth,
        json!({"name": "updatePassword", "url": IDP_LOGIN, "index": 0, "id": "pw", "password": "x"}),
    );
    assert_eq!(auth.open_channels(), 0);
    assert_eq!(auth.saml().scraped_password_count(), 0);
}

#[test]
fn test_reset_discards_stale_attestation_result() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });
    auth.handle(AuthEvent::HeadersReceived(
        Response::new(IDP_LOGIN, 302).with_header(CHALLENGE_HEADER, "nonce"),
    ));
    auth.handle(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)));
    assert_eq!(auth.saml().attestation().stage(), Stage::RedirectCanceled);

    auth.handle(AuthEvent::Reset);
    let effects = auth.handle(AuthEvent::AttestationResolved {
        cycle: 1,
        outcome: AttestationOutcome::Success {
            response: "late".into(),
        },
    });
    assert!(effects.is_empty());
    assert_eq!(auth.saml().attestation().stage(), Stage::None);
    assert_eq!(auth.faults().total(), 0);
}

fn armed_and_canceled() -> Authenticator {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });
    auth.handle(AuthEvent::HeadersReceived(
        Response::new(IDP_LOGIN, 302).with_header(CHALLENGE_HEADER, "nonce"),
    ));
    auth.handle(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)));
    assert_eq!(auth.saml().attestation().stage(), Stage::RedirectCanceled);
    auth
}

fn top_level_abort(code: i32) -> AuthEvent {
    AuthEvent::LoadAbort {
        url: IDP_LOGIN.into(),
        code,
        is_top_level: true,
    }
}

#[test]
fn test_real_abort_after_cycle_is_surfaced() {
    let mut auth = armed_and_canceled();
    // The redirect to the blank page committed without aborting anything.
    auth.handle(AuthEvent::AttestationResolved {
        cycle: 1,
        outcome: AttestationOutcome::Success {
            response: "signed".into(),
        },
    });
    auth.handle(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN)));
    auth.handle(AuthEvent::BeforeSendHeaders {
        url: IDP_LOGIN.into(),
        main_frame: true,
    });
    assert_eq!(auth.saml().attestation().stage(), Stage::None);

    let effects = auth.handle(top_level_abort(-105));
    assert_eq!(
        effects,
        vec![AuthEffect::LoadAborted {
            url: IDP_LOGIN.into(),
            code: -105
        }]
    );
}

#[test]
fn test_subframe_abort_does_not_expose_cancel() {
    let mut auth = armed_and_canceled();
    let effects = auth.handle(AuthEvent::LoadAbort {
        url: format!("{IDP_ORIGIN}/widget"),
        code: -2,
        is_top_level: false,
    });
    assert!(effects.is_empty());

    // The cancel's own abort still arrives afterwards.
    let effects = auth.handle(top_level_abort(-3));
    assert!(effects.is_empty());
}

#[test]
fn test_abort_while_idle_is_surfaced() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });
    assert_eq!(
        auth.handle(top_level_abort(-106)),
        vec![AuthEffect::LoadAborted {
            url: IDP_LOGIN.into(),
            code: -106
        }]
    );
    let subframe = auth.handle(AuthEvent::LoadAbort {
        url: IDP_LOGIN.into(),
        code: -106,
        is_top_level: false,
    });
    assert!(subframe.is_empty());
}

#[test]
fn test_channels_from_previous_load_are_closed() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA).starting_on_saml_page(),
    });
    let stale = InjectedScript::connect(&mut auth, IDP_ORIGIN, "injected");
    assert_eq!(auth.open_channels(), 1);

    let effects = auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA).starting_on_saml_page(),
    });
    assert_eq!(auth.open_channels(), 0);
    assert!(effects.contains(&AuthEffect::PostFrame {
        frame: Frame::Disconnect {
            channel_id: stale.channel_id
        }
        .encode()
    }));

    stale.post(
        &mut auth,
        json!({"name": "updatePassword", "url": IDP_LOGIN, "index": 0, "id": "pw", "password": "old"}),
    );
    assert_eq!(auth.saml().scraped_password_count(), 0);
    assert_eq!(
        auth.transport().anomaly_count(TransportAnomaly::UnknownChannel),
        1
    );
}

#[test]
fn test_top_level_commit_closes_channels() {
    let mut auth = authenticator();
    auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });
    InjectedScript::connect(&mut auth, IDP_ORIGIN, "injected");
    InjectedScript::connect(&mut auth, GAIA_ORIGIN, "credentials");

    auth.handle(AuthEvent::LoadCommit {
        url: format!("{IDP_ORIGIN}/frame"),
        is_top_level: false,
    });
    assert_eq!(auth.open_channels(), 2);

    auth.handle(AuthEvent::LoadCommit {
        url: IDP_LOGIN.into(),
        is_top_level: true,
    });
    assert_eq!(auth.open_channels(), 0);

    auth.handle(AuthEvent::Reload);
    InjectedScript::connect(&mut auth, IDP_ORIGIN, "injected");
    assert_eq!(auth.open_channels(), 1);
    auth.handle(AuthEvent::Reload);
    assert_eq!(auth.open_channels(), 0);
}

fn attestation_cycle(challenge: &str, outcome: AttestationOutcome) -> (Vec<AuthEffect>, Stage) {
    let mut auth = authenticator();
    let mut effects = auth.handle(AuthEvent::Load {
        params: AuthParams::new(GAIA),
    });
    effects.extend(auth.handle(AuthEvent::HeadersReceived(
        Response::new(IDP_LOGIN, 302).with_header(CHALLENGE_HEADER, challenge),
    )));
    effects.extend(auth.handle(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN))));
    let cycle = effects
        .iter()
        .find_map(|effect| match effect {
            AuthEffect::ComputeAttestation { cycle, .. } => Some(*cycle),
            _ => None,
        })
        .expect("challenge starts a cycle");
    effects.extend(auth.handle(AuthEvent::AttestationResolved { cycle, outcome }));
    effects.extend(auth.handle(AuthEvent::BeforeRequest(Request::get(IDP_LOGIN))));
    effects.extend(auth.handle(AuthEvent::BeforeSendHeaders {
        url: IDP_LOGIN.into(),
        main_frame: true,
    }));
    (effects, auth.saml().attestation().stage())
}

fn completion_signal() -> impl Strategy<Value = AuthEvent> {
    prop_oneof![
        Just(AuthEvent::PageMessage {
            origin: GAIA_ORIGIN.into(),
            message: json!({"method": "userInfo", "services": ["drive"]}),
        }),
        Just(AuthEvent::PageMessage {
            origin: GAIA_ORIGIN.into(),
            message: json!({"method": "closeView"}),
        }),
        Just(AuthEvent::HeadersReceived(
            Response::new(GAIA, 200).with_header(SIGN_IN_HEADER, SIGN_IN)
        )),
        Just(AuthEvent::LoadCommit {
            url: GAIA.into(),
            is_top_level: true,
        }),
        (0u64..4).prop_map(|generation| AuthEvent::DoneTimeout { generation }),
        "[a-z]{1,8}".prop_map(|pw| AuthEvent::ManualPassword {
            password: Secret::new(pw)
        }),
        "[a-z]{1,8}".prop_map(|pw| AuthEvent::VerifyConfirmedPassword {
            password: Secret::new(pw)
        }),
    ]
}

proptest! {
    #[test]
    fn prop_attestation_single_cycle(
        challenge in "[A-Za-z0-9+/]{1,32}",
        response in "[A-Za-z0-9+/]{1,32}",
        success in any::<bool>(),
    ) {
        let outcome = if success {
            AttestationOutcome::Success { response: Secret::new(response.clone()) }
        } else {
            AttestationOutcome::Failure { reason: "denied".into() }
        };
        let (effects, stage) = attestation_cycle(&challenge, outcome);

        let cancels = effects
            .iter()
            .filter(|e| matches!(e, AuthEffect::RedirectRequest { .. }))
            .count();
        let replays = effects
            .iter()
            .filter(|e| matches!(e, AuthEffect::Navigate { url } if url == IDP_LOGIN))
            .count();
        prop_assert_eq!(cancels, 1);
        prop_assert_eq!(replays, 1);

        let attached: Vec<&Header> = effects
            .iter()
            .filter_map(|e| match e {
                AuthEffect::AddRequestHeader { header, .. } => Some(header),
                _ => None,
            })
            .collect();
        if success {
            let expected_header = Header::new(CHALLENGE_RESPONSE_HEADER, response);
            prop_assert_eq!(attached, vec![&expected_header]);
        } else {
            prop_assert!(attached.is_empty());
        }
        prop_assert_eq!(stage, Stage::None);
    }

    #[test]
    fn prop_initialize_negotiates_version(requested in 0u32..8) {
        let config = AuthConfig {
            min_api_version: 2,
            max_api_version: 4,
            ..Default::default()
        };
        let mut api = CredentialApi::new(&config);
        let initialized = api.process(&json!({"method": "initialize", "requestedVersion": requested}));
        api.process(&json!({"method": "add", "token": "t", "keyType": KEY_TYPE_PASSWORD_PLAIN, "passwordBytes": "bytes"})).ok();
        api.process(&json!({"method": "confirm", "token": "t"})).ok();

        if requested < 2 {
            prop_assert!(initialized.is_err());
            prop_assert!(api.api_password_bytes().is_none());
        } else {
            prop_assert_eq!(api.version(), Some(requested.min(4)));
            prop_assert_eq!(api.api_password_bytes().map(Secret::expose), Some("bytes"));
        }
    }

    #[test]
    fn prop_scraped_count_dedupes_values(
        first in "[a-z]{1,12}",
        second in "[a-z]{1,12}",
    ) {
        let mut store = PasswordStore::new();
        store.record(FieldKey::new(IDP_LOGIN, 0, "a"), Secret::new(first.clone()));
        store.record(FieldKey::new(IDP_LOGIN, 0, "b"), Secret::new(second.clone()));
        prop_assert_eq!(store.count(), if first == second { 1 } else { 2 });
    }

    #[test]
    fn prop_callbacks_fire_once_with_own_reply(order in Just((0u64..6).collect::<Vec<_>>()).prop_shuffle()) {
        let (tx, _rx) = mpsc::unbounded_channel::<Value>();
        let mut channel = Channel::<InjectedMessage>::new(ChannelId::generate(), "injected");
        channel.set_target(Arc::new(tx));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for expected in 0u64..6 {
            let seen = Arc::clone(&seen);
            channel.send_with_callback(&InjectedMessage::GetSamlFlag, move |result| {
                seen.lock().unwrap().push((expected, result));
            });
        }

        let mut ignore = |_: InjectedMessage| Reply::none();
        for request_id in order {
            let reply = json!({"name": INTERNAL_REPLY, "requestId": request_id, "result": request_id * 10});
            prop_assert!(channel.receive(reply, &mut ignore).is_ok());
        }

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|(expected, _)| *expected);
        let expected: Vec<(u64, Value)> = (0u64..6).map(|id| (id, json!(id * 10))).collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(channel.pending_requests(), 0);
    }

    #[test]
    fn prop_completion_fires_at_most_once(
        signals in proptest::collection::vec(completion_signal(), 0..24),
    ) {
        let mut auth = authenticator();
        auth.handle(AuthEvent::Load { params: AuthParams::new(GAIA) });
        let mut effects = auth.handle(AuthEvent::HeadersReceived(
            Response::new(GAIA, 200).with_header(SIGN_IN_HEADER, SIGN_IN),
        ));
        effects.extend(auth.handle(AuthEvent::PageMessage {
            origin: GAIA_ORIGIN.into(),
            message: json!({"method": "userInfo", "services": []}),
        }));
        effects.extend(auth.handle(AuthEvent::PageMessage {
            origin: GAIA_ORIGIN.into(),
            message: json!({"method": "closeView"}),
        }));
        effects.extend(auth.handle(AuthEvent::ManualPassword { password: "typed".into() }));
        prop_assert_eq!(completions(&effects).len(), 1);

        for signal in signals {
            effects.extend(auth.handle(signal));
        }
        prop_assert_eq!(completions(&effects).len(), 1);
    }
}
