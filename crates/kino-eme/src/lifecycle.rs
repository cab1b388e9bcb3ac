//! Key session lifecycle
//!
//! Drives one native key session from creation to closure:
//!
//! ```text
//! Created ─▶ AwaitingResponse ─▶ Licensed ─▶ Closing ─▶ Closed
//! ```
//!
//! License requests and renewals are exchanged with the license provider.
//! When any key expires the session is closed, deregistered and requested
//! again with the same init data.

use crate::cdm::{GenerateRequest, MediaKeySession, NativeSession, SessionEvent};
use crate::context::{PendingSessionRequest, Provisioned, SessionRequest, SourceContext};
use crate::error::{Error, Result};
use crate::events::{EmeEvent, KeyStatusEntry};
use crate::license::{request_license, LicenseMessage};
use crate::registry::RecordId;
use crate::types::{KeyStatus, MessageType, SessionState};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What the event loop does after an event
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct KeySessionLifecycle {
    context: Arc<SourceContext>,
    provisioned: Arc<Provisioned>,
    record: RecordId,
    request: SessionRequest,
    init_data: Bytes,
    content_id: Option<String>,
    renewals: u32,
    done: Option<oneshot::Sender<Result<()>>>,
    state: SessionState,
    usable_seen: bool,
    native: Option<NativeSession>,
}

impl KeySessionLifecycle {
    pub(crate) fn new(
        context: Arc<SourceContext>,
        provisioned: Arc<Provisioned>,
        record: RecordId,
        init_data: Bytes,
        pending: PendingSessionRequest,
    ) -> Self {
        let content_id = provisioned
            .options
            .content_id
            .as_ref()
            .and_then(|provider| provider.content_id(&init_data));

        Self {
            context,
            provisioned,
            record,
            request: pending.request,
            init_data,
            content_id,
            renewals: pending.renewals,
            done: pending.done,
            state: SessionState::Created,
            usable_seen: false,
            native: None,
        }
    }

    /// Create the native session and attach it to the registry record.
    ///
    /// Failure removes the record and rejects the waiting caller.
    pub(crate) fn open(&mut self) -> bool {
        match self.provisioned.media_keys.create_session() {
            Ok(session) => {
                self.context.registry().attach(self.record, Arc::clone(&session.handle));
                self.native = Some(session);
                true
            }
            Err(e) => {
                self.context.registry().remove_record(self.record);
                self.report(Error::SessionCreation(e.to_string()));
                false
            }
        }
    }

    /// Drop a session opened on a container that could not be bound
    pub(crate) async fn abandon(mut self, err: Error) {
        if let Some(NativeSession { handle, .. }) = self.native.take() {
            if let Err(e) = handle.close().await {
                warn!(session_id = %handle.session_id(), error = %e, "Failed to close abandoned key session");
            }
        }
        self.context.registry().remove_record(self.record);
        self.resolve(Err(err));
    }

    /// Run the session until it closes
    pub(crate) fn run(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.drive())
    }

    fn key_system(&self) -> &str {
        &self.provisioned.options.key_system
    }

    async fn drive(mut self) {
        if self.native.is_none() && !self.open() {
            return;
        }
        let Some(NativeSession { handle, mut events }) = self.native.take() else {
            return;
        };

        if self.context.is_closed() {
            let _ = handle.close().await;
            self.resolve(Err(Error::Closed));
            return;
        }

        self.context.events().emit(EmeEvent::KeySessionCreated {
            session_id: handle.session_id(),
            key_system: self.key_system().to_string(),
        });

        let generate = GenerateRequest {
            init_data_type: self.request.init_data_type.clone(),
            init_data: self.init_data.clone(),
            content_id: self.content_id.clone(),
        };
        if let Err(e) = handle.generate_request(&generate).await {
            self.context.registry().remove_record(self.record);
            self.report(Error::SessionCreation(e.to_string()));
            return;
        }
        self.transition(SessionState::AwaitingResponse);

        let mut closed = self.context.closed_watch();
        loop {
            if *closed.borrow_and_update() {
                debug!(session_id = %handle.session_id(), "Source closed, leaving key session");
                return;
            }

            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(&handle, event).await == Flow::Stop {
                            return;
                        }
                    }
                    None => {
                        debug!(session_id = %handle.session_id(), "Key session event stream ended");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, handle: &Arc<dyn MediaKeySession>, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Message { message_type, message } => {
                self.on_message(handle, message_type, message).await;
                Flow::Continue
            }
            SessionEvent::KeyStatusesChange(statuses) => self.on_key_statuses(handle, statuses).await,
            SessionEvent::KeyAdded => {
                debug!(session_id = %handle.session_id(), "Key added");
                self.usable_seen = true;
                self.resolve(Ok(()));
                Flow::Continue
            }
            SessionEvent::Error { code, system_code } => {
                self.report(Error::KeySession { code, system_code });
                Flow::Continue
            }
        }
    }

    async fn on_message(&mut self, handle: &Arc<dyn MediaKeySession>, message_type: MessageType, message: Bytes) {
        let session_id = handle.session_id();
        self.context.events().emit(EmeEvent::KeyMessage {
            session_id: session_id.clone(),
            message_type,
        });

        if !message_type.wants_license() {
            debug!(session_id = %session_id, message_type = ?message_type, "Ignoring key message");
            return;
        }

        let request = LicenseMessage {
            key_system: self.key_system().to_string(),
            message_type,
            message,
            content_id: self.content_id.clone(),
        };
        let license = request_license(&*self.provisioned.options.license, &request, self.context.events()).await;

        let result = match license {
            Ok(license) => handle.update(license).await.map_err(Error::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.transition(SessionState::Licensed);
                info!(session_id = %session_id, key_system = %self.key_system(), "License applied");
                self.resolve(Ok(()));
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "License exchange failed");
                self.report(e);
            }
        }
    }

    async fn on_key_statuses(&mut self, handle: &Arc<dyn MediaKeySession>, statuses: Vec<(Bytes, KeyStatus)>) -> Flow {
        let session_id = handle.session_id();
        let entries: Vec<KeyStatusEntry> = statuses
            .iter()
            .map(|(key_id, status)| KeyStatusEntry {
                key_id: hex::encode(key_id),
                status: *status,
            })
            .collect();

        self.context.events().emit(EmeEvent::KeyStatusesChange {
            session_id: session_id.clone(),
            statuses: entries.clone(),
        });

        let mut expired = false;
        for entry in entries {
            match entry.status {
                KeyStatus::InternalError => {
                    warn!(session_id = %session_id, key_id = %entry.key_id, "Key status internal-error");
                }
                KeyStatus::Expired => expired = true,
                KeyStatus::Usable => self.usable_seen = true,
                _ => {}
            }
            self.context.events().emit(EmeEvent::KeyStatusChange {
                session_id: session_id.clone(),
                key_id: entry.key_id,
                status: entry.status,
            });
        }

        if expired {
            self.expire(handle).await;
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Close an expired session and request a new one with the same init data
    async fn expire(&mut self, handle: &Arc<dyn MediaKeySession>) {
        let session_id = handle.session_id();
        self.transition(SessionState::Closing);
        if let Err(e) = handle.close().await {
            warn!(session_id = %session_id, error = %e, "Failed to close expired key session");
        }
        self.transition(SessionState::Closed);
        self.context.registry().remove_record(self.record);
        self.context.events().emit(EmeEvent::KeySessionClosed {
            session_id: session_id.clone(),
        });

        if self.context.is_closed() {
            return;
        }

        let renewals = if self.usable_seen { 1 } else { self.renewals + 1 };
        if renewals > self.context.options().max_session_renewals {
            self.report(Error::RenewalLimit { renewals });
            return;
        }

        let delay = self.context.options().renewal_delay(renewals);
        info!(session_id = %session_id, renewals, delay_ms = delay.as_millis() as u64, "Key session expired, renewing");

        let pending = PendingSessionRequest {
            request: SessionRequest {
                init_data_type: self.request.init_data_type.clone(),
                init_data: Some(self.init_data.clone()),
            },
            renewals,
            done: self.done.take(),
        };
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            context.enqueue(pending).await;
        });
    }

    fn transition(&mut self, target: SessionState) {
        if self.state.can_transition_to(target) {
            debug!(from = %self.state, to = %target, "Key session transition");
            self.state = target;
        } else {
            warn!(from = %self.state, to = %target, "Ignoring invalid key session transition");
        }
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    /// Reject the waiting caller, or the host error sink once nobody waits
    fn report(&mut self, err: Error) {
        match self.done.take() {
            Some(done) => {
                if let Err(Err(err)) = done.send(Err(err)) {
                    self.context.events().error(&err);
                }
            }
            None => self.context.events().error(&err),
        }
    }
}
