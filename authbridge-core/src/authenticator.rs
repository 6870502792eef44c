//! The authentication state machine.
//!
//! [`Authenticator`] is sans-IO: the environment reports what happened as
//! [`AuthEvent`]s and carries out the returned [`AuthEffect`]s. Every event
//! runs to completion; the only suspension points are the completion wait
//! timer and the attestation signer, both of which come back as events
//! tagged with the generation or cycle they belong to.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::attestation::{AttestationOutcome, CANCEL_DESTINATION};
use crate::channel::{Channel, PostTarget, Reply};
use crate::config::{AuthConfig, AuthParams};
use crate::coordinator::{
    decide_password, AuthCompletedCredentials, CompletionCoordinator, PasswordDecision,
    PasswordSources, Readiness,
};
use crate::credential_api::ApiEvent;
use crate::error::{ApiErrorKind, FaultCounters, Result, TransportAnomaly};
use crate::headers::{self, Header, SignInInfo, SIGN_IN_HEADER};
use crate::messages::{accepted_messages, GaiaMessage, InjectedMessage, PageMessage, Secret};
use crate::network::{Request, Response};
use crate::saml::{AttributeDecoder, InjectedNotice, RequestDecision, SamlHandler};
use crate::session::{AuthFlow, Session};
use crate::transport::{same_origin, ChannelId, Delivery, OriginAllowList, Source, Transport};

fn default_true() -> bool {
    true
}

/// Something the environment observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthEvent {
    /// Start a new flow.
    Load { params: AuthParams },
    Reload,
    /// Drop the flow entirely.
    Reset,
    BeforeRequest(Request),
    BeforeSendHeaders {
        url: String,
        #[serde(default = "default_true")]
        main_frame: bool,
    },
    HeadersReceived(Response),
    RequestCompleted {
        url: String,
        #[serde(default = "default_true")]
        main_frame: bool,
    },
    LoadCommit {
        url: String,
        #[serde(default = "default_true")]
        is_top_level: bool,
    },
    ContentLoad { url: String },
    LoadAbort {
        url: String,
        code: i32,
        #[serde(default = "default_true")]
        is_top_level: bool,
    },
    /// Transport frame posted up by the hosted surface.
    TransportFrame { origin: String, frame: Value },
    /// Page message posted by the hosted surface.
    PageMessage { origin: String, message: Value },
    VerifyConfirmedPassword { password: Secret },
    ManualPassword { password: Secret },
    DoneTimeout { generation: u64 },
    AttestationResolved { cycle: u64, outcome: AttestationOutcome },
}

/// Something the environment must do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthEffect {
    Navigate { url: String },
    /// Drop the request.
    CancelRequest { url: String },
    /// Redirect the request before it is sent.
    RedirectRequest { url: String, redirect_to: String },
    AddRequestHeader { url: String, header: Header },
    /// Transport frame for the hosted surface.
    PostFrame { frame: Value },
    PostPageMessage { message: Value, target_url: String },
    ArmDoneTimer { generation: u64, delay_ms: u64 },
    CancelDoneTimer { generation: u64 },
    ComputeAttestation {
        cycle: u64,
        url: String,
        challenge: String,
    },
    Ready,
    AuthFlowChanged { flow: AuthFlow },
    AuthPageLoaded { is_saml_page: bool },
    InsecureContentBlocked { url: String },
    LoadAborted { url: String, code: i32 },
    MissingGaiaInfo,
    ApiPasswordAdded,
    AccountCreated,
    AttemptLogin { email: String },
    IdentifierEntered { account_identifier: String },
    ScrollInfo { width: u32, height: u32 },
    /// The confirmed password matched no scraped value; ask again.
    ConfirmPassword { email: String, count: usize },
    DisambiguatePassword { email: String, count: usize },
    RequestPassword { email: String },
    OnePasswordScraped,
    SamlProviderIdentified { certificate: String },
    Completed { credentials: Box<AuthCompletedCredentials> },
}

/// Collects frames the transport posts down to the hosted surface.
#[derive(Default)]
struct SurfaceOutbox {
    frames: Mutex<VecDeque<Value>>,
}

impl SurfaceOutbox {
    fn drain(&self) -> Vec<Value> {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.drain(..).collect()
    }
}

impl PostTarget for SurfaceOutbox {
    fn post_message(&self, message: Value) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
    }
}

type Effects = Vec<AuthEffect>;

pub struct Authenticator {
    params: Option<AuthParams>,
    session: Session,
    password: Option<Secret>,
    saml: SamlHandler,
    coordinator: CompletionCoordinator,
    transport: Arc<Transport>,
    outbox: Arc<SurfaceOutbox>,
    channels: HashMap<ChannelId, Channel<InjectedMessage>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let allow_list = OriginAllowList::new(&config.allowed_origins)?;
        Ok(Self {
            params: None,
            session: Session::default(),
            password: None,
            saml: SamlHandler::new(&config),
            coordinator: CompletionCoordinator::new(config.done_wait_timeout),
            transport: Arc::new(Transport::daemon(allow_list)),
            outbox: Arc::new(SurfaceOutbox::default()),
            channels: HashMap::new(),
        })
    }

    pub fn with_attribute_decoder(mut self, decoder: Box<dyn AttributeDecoder>) -> Self {
        self.saml.set_attribute_decoder(decoder);
        self
    }

    pub fn params(&self) -> Option<&AuthParams> {
        self.params.as_ref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn saml(&self) -> &SamlHandler {
        &self.saml
    }

    pub fn coordinator(&self) -> &CompletionCoordinator {
        &self.coordinator
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn faults(&self) -> &FaultCounters {
        self.saml.faults()
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn completion_fired(&self) -> bool {
        self.session.completion_fired
    }

    /// Process one event to completion.
    pub fn handle(&mut self, event: AuthEvent) -> Vec<AuthEffect> {
        let mut fx = Effects::new();
        match event {
            AuthEvent::Load { params } => self.load(params, &mut fx),
            AuthEvent::Reload => self.reload(&mut fx),
            AuthEvent::Reset => self.reset(&mut fx),
            AuthEvent::BeforeRequest(request) => self.on_before_request(&request, &mut fx),
            AuthEvent::BeforeSendHeaders { url, main_frame } => {
                if main_frame {
                    if let Some(header) = self.saml.on_before_send_headers() {
                        fx.push(AuthEffect::AddRequestHeader { url, header });
                    }
                }
            }
            AuthEvent::HeadersReceived(response) => self.on_headers_received(&response),
            AuthEvent::RequestCompleted { url, main_frame } => {
                if main_frame && !url.starts_with("https") {
                    debug!(%url, "Flow is no longer trusted");
                    self.session.trusted = false;
                }
            }
            AuthEvent::LoadCommit { url, is_top_level } => {
                self.on_load_commit(&url, is_top_level, &mut fx)
            }
            AuthEvent::ContentLoad { url } => self.on_content_load(url, &mut fx),
            AuthEvent::LoadAbort {
                url,
                code,
                is_top_level,
            } => {
                if !is_top_level {
                    debug!(%url, code, "Subframe load abort ignored");
                } else if self.saml.is_intentional_abort() {
                    debug!(%url, "Self-inflicted load abort suppressed");
                } else {
                    fx.push(AuthEffect::LoadAborted { url, code });
                }
            }
            AuthEvent::TransportFrame { origin, frame } => {
                self.on_transport_frame(origin, frame, &mut fx)
            }
            AuthEvent::PageMessage { origin, message } => {
                self.on_page_message(&origin, &message, &mut fx)
            }
            AuthEvent::VerifyConfirmedPassword { password } => {
                self.verify_confirmed_password(password, &mut fx)
            }
            AuthEvent::ManualPassword { password } => {
                if !self.session.completion_fired {
                    self.password = Some(password);
                    self.on_auth_completed(&mut fx);
                }
            }
            AuthEvent::DoneTimeout { generation } => self.on_done_timeout(generation, &mut fx),
            AuthEvent::AttestationResolved { cycle, outcome } => {
                if let Some(url) = self.saml.on_attestation_resolved(cycle, outcome) {
                    fx.push(AuthEffect::Navigate { url });
                }
            }
        }
        fx.extend(
            self.outbox
                .drain()
                .into_iter()
                .map(|frame| AuthEffect::PostFrame { frame }),
        );
        fx
    }

    fn load(&mut self, params: AuthParams, fx: &mut Effects) {
        self.reset_states(fx);
        self.session.completion_fired = false;
        self.close_channels();
        self.saml.configure(&params);
        if let Some(email) = &params.email {
            self.session.set_email(email.as_str());
        }
        info!(idp_origin = %params.idp_origin, starts_on_saml_page = params.starts_on_saml_page, "Loading authentication flow");
        fx.push(AuthEffect::Navigate {
            url: params.initial_frame_url.clone(),
        });
        self.params = Some(params);
        self.session.is_loaded = true;
    }

    fn reload(&mut self, fx: &mut Effects) {
        self.reset_states(fx);
        self.session.completion_fired = false;
        self.close_channels();
        let Some(params) = &self.params else {
            warn!("Reload requested before any load");
            return;
        };
        self.saml.configure(params);
        fx.push(AuthEffect::Navigate {
            url: params.initial_frame_url.clone(),
        });
        self.session.is_loaded = true;
    }

    fn reset(&mut self, fx: &mut Effects) {
        self.reset_states(fx);
        self.session.completion_fired = false;
        self.close_channels();
        self.params = None;
    }

    /// Tear down every channel opened by the hosted documents.
    fn close_channels(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        debug!(count = self.channels.len(), "Closing channels of the previous document");
        for (channel_id, mut channel) in self.channels.drain() {
            channel.close();
            self.transport.disconnect(channel_id);
        }
    }

    /// Clear the flow but keep the completion guard.
    fn reset_states(&mut self, fx: &mut Effects) {
        self.session.reset_states();
        self.password = None;
        self.saml.reset();
        if let Some(generation) = self.coordinator.reset() {
            fx.push(AuthEffect::CancelDoneTimer { generation });
        }
    }

    fn on_before_request(&mut self, request: &Request, fx: &mut Effects) {
        match self.saml.on_before_request(request) {
            RequestDecision::Proceed => {}
            RequestDecision::BlockInsecure { url } => {
                fx.push(AuthEffect::CancelRequest { url: url.clone() });
                if self.session.is_loaded {
                    fx.push(AuthEffect::InsecureContentBlocked { url });
                }
            }
            RequestDecision::Attest {
                cycle,
                url,
                challenge,
            } => {
                fx.push(AuthEffect::RedirectRequest {
                    url: url.clone(),
                    redirect_to: CANCEL_DESTINATION.to_string(),
                });
                fx.push(AuthEffect::ComputeAttestation {
                    cycle,
                    url,
                    challenge,
                });
            }
        }
    }

    fn on_headers_received(&mut self, response: &Response) {
        if !self.session.completion_fired && self.is_idp_url(&response.url) {
            if let Some(value) = headers::find(&response.headers, SIGN_IN_HEADER) {
                match SignInInfo::parse(value) {
                    Ok(info) => {
                        debug!(gaia_id = %info.gaia_id, "Sign-in header received");
                        self.session.apply_sign_in(info);
                    }
                    Err(err) => warn!(error = %err, "Ignoring sign-in header"),
                }
            }
        }
        if self.saml.on_headers_received(response) {
            debug!(url = %response.url, "Attestation challenge armed");
        }
    }

    fn on_load_commit(&mut self, url: &str, is_top_level: bool, fx: &mut Effects) {
        if is_top_level {
            // Scripts of the replaced document can no longer talk to us.
            self.close_channels();
        }
        if let Some(is_saml_page) = self.saml.on_load_commit(url, is_top_level) {
            self.on_auth_page_loaded(is_saml_page, fx);
        }
        if is_top_level && self.session.gaia_id.is_some() {
            self.maybe_complete(fx);
        }
    }

    fn on_auth_page_loaded(&mut self, is_saml_page: bool, fx: &mut Effects) {
        fx.push(AuthEffect::AuthPageLoaded { is_saml_page });
        if !self.session.is_loaded || !is_saml_page {
            return;
        }
        if self.session.auth_flow != AuthFlow::Saml {
            self.session.auth_flow = AuthFlow::Saml;
            fx.push(AuthEffect::AuthFlowChanged {
                flow: AuthFlow::Saml,
            });
        }
        self.fire_ready(fx);
    }

    fn on_content_load(&mut self, url: String, fx: &mut Effects) {
        let is_acl_url = self
            .params
            .as_ref()
            .and_then(|p| p.saml_acl_url.as_deref())
            .is_some_and(|acl| acl == url);
        if self.is_idp_url(&url) {
            fx.push(AuthEffect::PostPageMessage {
                message: json!({ "method": "handshake" }),
                target_url: url,
            });
            self.fire_ready(fx);
        } else if url == CANCEL_DESTINATION {
            self.fire_ready(fx);
        } else if is_acl_url {
            info!("SAML assertion consumer reached; skipping identity info");
            self.session.skip_for_now = true;
            self.on_auth_completed(fx);
        }
    }

    fn on_transport_frame(&mut self, origin: String, frame: Value, fx: &mut Effects) {
        let port: Arc<dyn PostTarget> = self.outbox.clone();
        let Some(delivery) = self.transport.receive(Source::Child { origin, port }, frame) else {
            return;
        };

        match delivery {
            Delivery::Connected {
                channel_id,
                name,
                origin,
            } => {
                let Some(names) = accepted_messages(&name) else {
                    warn!(%name, %origin, "Unknown channel name rejected");
                    self.transport
                        .record_anomaly(TransportAnomaly::UnknownChannelName);
                    self.transport.disconnect(channel_id);
                    return;
                };
                let mut channel = Channel::new(channel_id, name);
                for &message in names {
                    channel.register(message);
                }
                channel.set_target(self.transport.port(channel_id));
                self.channels.insert(channel_id, channel);
            }
            Delivery::Message {
                channel_id,
                payload,
            } => {
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    self.transport
                        .record_anomaly(TransportAnomaly::UnknownChannel);
                    return;
                };
                let saml = &mut self.saml;
                let mut notices = Vec::new();
                let mut handler = |message: InjectedMessage| {
                    let (reply, notice) = saml.handle_injected(message);
                    notices.extend(notice);
                    Reply::Ready(reply)
                };
                if let Err(anomaly) = channel.receive(payload, &mut handler) {
                    self.transport.record_anomaly(anomaly);
                }
                for notice in notices {
                    self.on_injected_notice(notice, fx);
                }
            }
            Delivery::Disconnected { channel_id } => {
                if let Some(mut channel) = self.channels.remove(&channel_id) {
                    debug!(channel = %channel_id, name = channel.name(), "Channel disconnected");
                    channel.close();
                }
            }
        }
    }

    fn on_injected_notice(&mut self, notice: InjectedNotice, fx: &mut Effects) {
        match notice {
            InjectedNotice::Api(ApiEvent::Initialized { .. }) => {}
            InjectedNotice::Api(ApiEvent::PasswordAdded { .. }) => {
                fx.push(AuthEffect::ApiPasswordAdded);
                self.coordinator.set_waiting_for_api_confirm(true);
                // The add may arrive after the commit that carried identity.
                if self.session.gaia_id.is_some() {
                    self.maybe_complete(fx);
                }
            }
            InjectedNotice::Api(ApiEvent::PasswordConfirmed { .. }) => {
                self.coordinator.set_waiting_for_api_confirm(false);
                if self.session.gaia_id.is_some() {
                    self.maybe_complete(fx);
                }
            }
            InjectedNotice::Api(ApiEvent::AccountCreated { .. }) => {
                fx.push(AuthEffect::AccountCreated);
            }
            InjectedNotice::PasswordScraped { .. } | InjectedNotice::PageLoaded { .. } => {}
            InjectedNotice::ScrollInfo { width, height } => {
                fx.push(AuthEffect::ScrollInfo { width, height });
            }
        }
    }

    fn on_page_message(&mut self, origin: &str, raw: &Value, fx: &mut Effects) {
        if !self.is_idp_url(origin) {
            debug!(%origin, "Page message from foreign origin ignored");
            return;
        }
        let message = match GaiaMessage::classify(raw) {
            PageMessage::Gaia(message) => message,
            PageMessage::Unrecognized(method) => {
                warn!(%method, "Unrecognized page message");
                return;
            }
            PageMessage::Foreign => return,
        };
        if message.is_ignored() {
            return;
        }
        if self.session.completion_fired {
            warn!(?message, "Page message after completion");
        }

        match message {
            GaiaMessage::UserInfo { services } => {
                self.coordinator.set_services(services);
                if self.session.has_identity() {
                    self.maybe_complete(fx);
                }
            }
            GaiaMessage::CloseView => {
                self.coordinator.set_close_view();
                if self.session.has_identity() {
                    self.maybe_complete(fx);
                }
            }
            GaiaMessage::SyncTrustedVaultKeys { value } => {
                self.session.sync_trusted_vault_keys = Some(value);
            }
            GaiaMessage::AttemptLogin { email } => {
                self.session.set_email(email.as_str());
                fx.push(AuthEffect::AttemptLogin { email });
            }
            GaiaMessage::IdentifierEntered { account_identifier } => {
                self.session.set_email(account_identifier.as_str());
                fx.push(AuthEffect::IdentifierEntered { account_identifier });
            }
            GaiaMessage::ClearOldAttempts | GaiaMessage::ShowConfirmCancel => {}
        }
    }

    fn verify_confirmed_password(&mut self, password: Secret, fx: &mut Effects) {
        if self.session.completion_fired {
            return;
        }
        if self.saml.verify_confirmed_password(password.expose()) {
            self.password = Some(password);
            self.on_auth_completed(fx);
        } else {
            fx.push(AuthEffect::ConfirmPassword {
                email: self.email(),
                count: self.saml.scraped_password_count(),
            });
        }
    }

    fn on_done_timeout(&mut self, generation: u64, fx: &mut Effects) {
        let Some(abandoned_confirm) = self.coordinator.on_timeout(generation) else {
            return;
        };
        if abandoned_confirm {
            self.saml.record_api_fault(ApiErrorKind::PasswordNotConfirmed);
        }
        self.maybe_complete(fx);
    }

    fn maybe_complete(&mut self, fx: &mut Effects) {
        if self.session.completion_fired {
            return;
        }
        if !self.session.has_identity() && !self.session.skip_for_now {
            warn!("Identity incomplete at completion; restarting flow");
            fx.push(AuthEffect::MissingGaiaInfo);
            if let Some(params) = &self.params {
                fx.push(AuthEffect::Navigate {
                    url: params.initial_frame_url.clone(),
                });
            }
            return;
        }

        match self.coordinator.check() {
            Readiness::Waiting => return,
            Readiness::ArmTimer { generation, delay } => {
                fx.push(AuthEffect::ArmDoneTimer {
                    generation,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                return;
            }
            Readiness::Done { cancel_timer } => {
                if let Some(generation) = cancel_timer {
                    fx.push(AuthEffect::CancelDoneTimer { generation });
                }
            }
        }

        if self.session.is_saml() {
            if let Some(certificate) = self.saml.x509_certificate() {
                fx.push(AuthEffect::SamlProviderIdentified {
                    certificate: certificate.to_string(),
                });
            }
        }

        let (need_password, request_when_none_scraped) = self
            .params
            .as_ref()
            .map(|p| (p.need_password, p.request_password_when_none_scraped))
            .unwrap_or((true, true));
        let decision = decide_password(PasswordSources {
            api_password: self.saml.api().api_password_bytes(),
            scraped_count: self.saml.scraped_password_count(),
            first_scraped: self.saml.passwords().first(),
            need_password,
            request_when_none_scraped,
        });

        match decision {
            PasswordDecision::Finish(password) => {
                self.password = password;
                self.on_auth_completed(fx);
            }
            PasswordDecision::FinishWithScraped(password) => {
                self.password = Some(password);
                fx.push(AuthEffect::OnePasswordScraped);
                self.on_auth_completed(fx);
            }
            PasswordDecision::RequestPassword => {
                fx.push(AuthEffect::RequestPassword {
                    email: self.email(),
                });
            }
            PasswordDecision::Disambiguate { count } => {
                fx.push(AuthEffect::DisambiguatePassword {
                    email: self.email(),
                    count,
                });
            }
        }
    }

    fn on_auth_completed(&mut self, fx: &mut Effects) {
        if self.session.completion_fired {
            return;
        }
        let using_saml = self.session.is_saml();
        let (public_saml, extract_attributes) = self
            .params
            .as_ref()
            .map(|p| (p.saml_acl_url.is_some(), p.extract_saml_password_attributes))
            .unwrap_or_default();

        let credentials = AuthCompletedCredentials {
            email: self.email(),
            gaia_id: self.session.gaia_id.clone().unwrap_or_default(),
            password: self.password.take().unwrap_or_default(),
            using_saml,
            scraped_saml_passwords: if using_saml && !self.saml.api_used() {
                self.saml.passwords().scraped()
            } else {
                Vec::new()
            },
            public_saml,
            skip_for_now: self.session.skip_for_now,
            session_index: self.session.session_index.clone().unwrap_or_default(),
            trusted: self.session.trusted,
            services: self.coordinator.services().to_vec(),
            services_provided: self.coordinator.services_provided(),
            password_attributes: if using_saml && extract_attributes {
                self.saml.password_attributes().clone()
            } else {
                Default::default()
            },
            sync_trusted_vault_keys: self
                .session
                .sync_trusted_vault_keys
                .clone()
                .unwrap_or_else(|| json!({})),
        };
        info!(
            using_saml,
            skip_for_now = credentials.skip_for_now,
            services_provided = credentials.services_provided,
            trusted = credentials.trusted,
            "Authentication completed"
        );
        fx.push(AuthEffect::Completed {
            credentials: Box::new(credentials),
        });
        self.reset_states(fx);
        self.session.completion_fired = true;
    }

    fn fire_ready(&mut self, fx: &mut Effects) {
        if !self.session.ready_fired {
            self.session.ready_fired = true;
            fx.push(AuthEffect::Ready);
        }
    }

    fn email(&self) -> String {
        self.session.email.clone().unwrap_or_default()
    }

    fn is_idp_url(&self, url: &str) -> bool {
        self.params
            .as_ref()
            .is_some_and(|p| same_origin(url, &p.idp_origin))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("session", &self.session)
            .field("saml", &self.saml)
            .field("coordinator", &self.coordinator)
            .field("channels", &self.channels.len())
            .finish()
    }
}
