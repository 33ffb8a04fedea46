//! Data services and the commission protocol.
//!
//! Every worker (memory manager, raw reader, montage processor) runs as a thread draining one
//! inbox.  The coordinator talks to it in `commissions`: `{ action, rn, payload }` requests
//! answered by exactly one `{ action, rn, success, reason, payload }` response.  Request numbers
//! are monotonic per service; a worker rejects duplicates, answers abandoned requests as
//! cancelled, and answers everything still queued at shutdown with reason `"shutdown"`.
//!
//! Handlers cascade: a service's own handler gets the commission first and hands anything it
//! does not understand to its parent, so shared actions (settings updates) live in one place.

pub mod workers;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use signal_synchronization::{CacheToken, WordRange};

use crate::cache::SignalCachePart;
use crate::config::{ABANDON_TIMEOUT, ALLOCATION_TIMEOUT, RESPONSE_TIMEOUT, SETUP_TIMEOUT};
use crate::error::{Error, Result};
use crate::events::PropertyValue;
use crate::montage::config::{FilterKind, FilterSettings, MontageConfig};
use crate::montage::MontageSignals;
use crate::recording::channel::SourceChannel;
use crate::recording::interruption::Interruption;
use crate::unique_id::UniqueId;

/// Wire-visible action names.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ActionKind {
    SetupWorker,
    SetupInputCache,
    SetupInputMutex,
    SetupInputSharedWorker,
    MapChannels,
    GetSignals,
    CacheSignals,
    SetFilters,
    SetInterruptions,
    ReleaseCache,
    UpdateSettings,
    ReleaseAndRearrange,
    SetBuffer,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SetupWorker => "setup-worker",
            ActionKind::SetupInputCache => "setup-input-cache",
            ActionKind::SetupInputMutex => "setup-input-mutex",
            ActionKind::SetupInputSharedWorker => "setup-input-shared-worker",
            ActionKind::MapChannels => "map-channels",
            ActionKind::GetSignals => "get-signals",
            ActionKind::CacheSignals => "cache-signals",
            ActionKind::SetFilters => "set-filters",
            ActionKind::SetInterruptions => "set-interruptions",
            ActionKind::ReleaseCache => "release-cache",
            ActionKind::UpdateSettings => "update-settings",
            ActionKind::ReleaseAndRearrange => "release-and-rearrange",
            ActionKind::SetBuffer => "set-buffer",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed commission payloads.  Several variants share one wire action where the original
/// protocol overloads it (`setup-worker`, `set-filters`).
#[derive(Clone, Debug)]
pub enum CommissionPayload {
    /// Reader: decode the header.
    SetupWorker,
    /// Montage: adopt the recipe and recording facts.
    SetupMontage {
        config: MontageConfig,
        channels: Vec<SourceChannel>,
        data_duration: f64,
        interruptions: Vec<Interruption>,
    },
    /// Reader: claim and initialize the input cache.
    SetupInputCache,
    /// Montage: build a read view of the raw cache from a coupled-mutex token.
    SetupInputMutex {
        token: CacheToken,
        raw_owner: Option<UniqueId>,
    },
    /// Montage: same view, but the token was brokered by a shared worker.
    SetupInputSharedWorker {
        token: CacheToken,
        raw_owner: Option<UniqueId>,
    },
    MapChannels,
    GetSignals {
        start: f64,
        end: f64,
    },
    /// Reader: pump the whole source into the cache.
    CacheSignals,
    /// Recording-wide filter defaults.
    SetFilters {
        filters: FilterSettings,
    },
    /// One channel's override; same wire action as [CommissionPayload::SetFilters].
    SetChannelFilter {
        channel: usize,
        kind: FilterKind,
        value: Option<f64>,
    },
    SetInterruptions {
        items: Vec<Interruption>,
    },
    /// Cache holder: drop the cache views (the service then releases the range).
    ReleaseCache,
    /// Memory manager: free `owner`'s whole range; same wire action as
    /// [CommissionPayload::ReleaseCache].
    ReleaseBuffer {
        owner: UniqueId,
    },
    UpdateSettings {
        entries: Vec<(String, PropertyValue)>,
    },
    /// Memory manager: give back ranges and/or acknowledge a rearrangement.
    ReleaseAndRearrange {
        ranges: Vec<WordRange>,
        acknowledge: Option<UniqueId>,
    },
    /// Cache holder: your range moved; rebase views, then acknowledge to the manager.  Part of
    /// the `release-and-rearrange` barrier.
    Rearrange {
        owner: UniqueId,
        new_start: usize,
    },
    /// Memory manager: allocate a range for `owner`.
    SetBuffer {
        owner: UniqueId,
        bytes: usize,
        depends_on: Option<UniqueId>,
    },
}

impl CommissionPayload {
    pub fn action(&self) -> ActionKind {
        match self {
            CommissionPayload::SetupWorker | CommissionPayload::SetupMontage { .. } => {
                ActionKind::SetupWorker
            }
            CommissionPayload::SetupInputCache => ActionKind::SetupInputCache,
            CommissionPayload::SetupInputMutex { .. } => ActionKind::SetupInputMutex,
            CommissionPayload::SetupInputSharedWorker { .. } => ActionKind::SetupInputSharedWorker,
            CommissionPayload::MapChannels => ActionKind::MapChannels,
            CommissionPayload::GetSignals { .. } => ActionKind::GetSignals,
            CommissionPayload::CacheSignals => ActionKind::CacheSignals,
            CommissionPayload::SetFilters { .. } | CommissionPayload::SetChannelFilter { .. } => {
                ActionKind::SetFilters
            }
            CommissionPayload::SetInterruptions { .. } => ActionKind::SetInterruptions,
            CommissionPayload::ReleaseCache | CommissionPayload::ReleaseBuffer { .. } => {
                ActionKind::ReleaseCache
            }
            CommissionPayload::UpdateSettings { .. } => ActionKind::UpdateSettings,
            CommissionPayload::ReleaseAndRearrange { .. }
            | CommissionPayload::Rearrange { .. } => ActionKind::ReleaseAndRearrange,
            CommissionPayload::SetBuffer { .. } => ActionKind::SetBuffer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Commission {
    pub rn: u64,
    pub payload: CommissionPayload,
}

impl Commission {
    pub fn action(&self) -> ActionKind {
        self.payload.action()
    }
}

#[derive(Debug)]
pub enum ResponsePayload {
    None,
    DataDuration(f64),
    /// An allocated range (memory manager answering `set-buffer`).
    Token(CacheToken),
    /// A readable cache view plus the owner id other services name it by.
    Cache {
        token: CacheToken,
        owner: UniqueId,
    },
    Warnings(Vec<String>),
    Signals(MontageSignals),
    Part(SignalCachePart),
}

#[derive(Debug)]
pub struct CommissionResponse {
    pub rn: u64,
    pub action: ActionKind,
    pub success: bool,
    pub reason: Option<String>,
    pub payload: ResponsePayload,
}

impl CommissionResponse {
    pub fn ok(rn: u64, action: ActionKind, payload: ResponsePayload) -> CommissionResponse {
        CommissionResponse {
            rn,
            action,
            success: true,
            reason: None,
            payload,
        }
    }

    pub fn fail(rn: u64, action: ActionKind, reason: impl Into<String>) -> CommissionResponse {
        CommissionResponse {
            rn,
            action,
            success: false,
            reason: Some(reason.into()),
            payload: ResponsePayload::None,
        }
    }

    /// Collapse the wire shape back into a [Result].  Error taxonomy flattens at the worker
    /// boundary; cancellation reasons stay distinguishable.
    pub fn into_result(self) -> Result<ResponsePayload> {
        if self.success {
            return Ok(self.payload);
        }
        match self.reason.as_deref() {
            Some("cancelled") => Err(Error::Cancelled("cancelled")),
            Some("shutdown") => Err(Error::Cancelled("shutdown")),
            Some("timeout") => Err(Error::Cancelled("timeout")),
            Some(reason) => Err(Error::Protocol(format!("{} failed: {reason}", self.action))),
            None => Err(Error::Protocol(format!("{} failed", self.action))),
        }
    }
}

/// What a handler did with a commission.
pub enum Outcome {
    Handled(CommissionResponse),
    /// Not mine; let the parent in the cascade look at it.
    Unhandled(Commission),
}

pub trait CommissionHandler: Send {
    fn handle(&mut self, commission: Commission) -> Outcome;
}

/// Child-first composition of two handlers.
pub struct Cascade<C, P> {
    pub child: C,
    pub parent: P,
}

impl<C: CommissionHandler, P: CommissionHandler> CommissionHandler for Cascade<C, P> {
    fn handle(&mut self, commission: Commission) -> Outcome {
        match self.child.handle(commission) {
            Outcome::Unhandled(commission) => self.parent.handle(commission),
            handled => handled,
        }
    }
}

enum Envelope {
    Commission {
        commission: Commission,
        reply: Sender<CommissionResponse>,
        enqueued: Instant,
    },
    Shutdown,
}

/// A handle to a spawned service.  Cloning shares the inbox and the request-number counter.
pub struct ServiceHandle {
    name: String,
    inbox: Sender<Envelope>,
    next_rn: Arc<AtomicU64>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// One outstanding commission.
pub struct PendingResponse {
    rn: u64,
    action: ActionKind,
    receiver: Receiver<CommissionResponse>,
}

impl PendingResponse {
    pub fn rn(&self) -> u64 {
        self.rn
    }

    /// Wait with the action's standard deadline.  Timeouts and a dead worker synthesize a
    /// failed response rather than an error, matching the wire contract.
    pub fn wait(self) -> CommissionResponse {
        let timeout = match self.action {
            ActionKind::SetupWorker
            | ActionKind::SetupInputCache
            | ActionKind::SetupInputMutex
            | ActionKind::SetupInputSharedWorker
            | ActionKind::MapChannels => SETUP_TIMEOUT,
            ActionKind::SetBuffer => ALLOCATION_TIMEOUT,
            _ => RESPONSE_TIMEOUT,
        };
        self.wait_timeout(timeout)
    }

    pub fn wait_timeout(self, timeout: Duration) -> CommissionResponse {
        match self.receiver.recv_timeout(timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                CommissionResponse::fail(self.rn, self.action, "timeout")
            }
            Err(RecvTimeoutError::Disconnected) => {
                CommissionResponse::fail(self.rn, self.action, "shutdown")
            }
        }
    }
}

impl ServiceHandle {
    /// Spawn a worker thread draining commissions into `handler`.
    pub fn spawn(name: impl Into<String>, handler: impl CommissionHandler + 'static) -> ServiceHandle {
        let name = name.into();
        let (inbox, rx) = unbounded();
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let thread_name = name.clone();
        let thread_shutdown = shutdown.clone();
        let worker = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_loop(&thread_name, handler, rx, thread_shutdown))
            .expect("spawning a service worker thread");
        ServiceHandle {
            name,
            inbox,
            next_rn: Arc::new(AtomicU64::new(1)),
            shutdown,
            worker: Some(worker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a commission; the response arrives on the returned pending handle.
    pub fn commission(&self, payload: CommissionPayload) -> PendingResponse {
        let rn = self.next_rn.fetch_add(1, Ordering::Relaxed);
        self.commission_with_rn(rn, payload)
    }

    /// Enqueue with an explicit request number.  Normal traffic uses [ServiceHandle::commission];
    /// this exists for bridging externally-numbered requests (and for exercising the duplicate
    /// guard).
    pub fn commission_with_rn(&self, rn: u64, payload: CommissionPayload) -> PendingResponse {
        let action = payload.action();
        let (reply, receiver) = bounded(1);
        let envelope = Envelope::Commission {
            commission: Commission { rn, payload },
            reply,
            enqueued: Instant::now(),
        };
        if self.inbox.send(envelope).is_err() {
            // Worker already gone; the receiver half was dropped with it and wait() will
            // report shutdown.
            log::debug!("service {}: commission {rn} after shutdown", self.name);
        }
        PendingResponse {
            rn,
            action,
            receiver,
        }
    }

    /// Commission and wait, collapsing the response into a [Result].
    pub fn request(&self, payload: CommissionPayload) -> Result<ResponsePayload> {
        self.commission(payload).wait().into_result()
    }
}

impl Clone for ServiceHandle {
    fn clone(&self) -> Self {
        ServiceHandle {
            name: self.name.clone(),
            inbox: self.inbox.clone(),
            next_rn: self.next_rn.clone(),
            shutdown: self.shutdown.clone(),
            worker: None,
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Flag first so queued-but-unprocessed commissions reject rather than run.
            self.shutdown.store(true, Ordering::Release);
            let _ = self.inbox.send(Envelope::Shutdown);
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    name: &str,
    mut handler: impl CommissionHandler,
    rx: Receiver<Envelope>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut last_rn: Option<u64> = None;

    while let Ok(envelope) = rx.recv() {
        let (commission, reply, enqueued) = match envelope {
            Envelope::Shutdown => break,
            Envelope::Commission {
                commission,
                reply,
                enqueued,
            } => (commission, reply, enqueued),
        };

        let rn = commission.rn;
        let action = commission.action();

        if shutdown.load(Ordering::Acquire) {
            let _ = reply.send(CommissionResponse::fail(rn, action, "shutdown"));
            continue;
        }

        // The consumer stopped waiting long ago; short-circuit without running the handler.
        if enqueued.elapsed() >= ABANDON_TIMEOUT {
            log::debug!("service {name}: commission {rn} ({action}) abandoned");
            let _ = reply.send(CommissionResponse::fail(rn, action, "cancelled"));
            continue;
        }

        // Request numbers only move forward.
        if last_rn.is_some_and(|last| rn <= last) {
            log::error!("service {name}: duplicate or regressed rn {rn} ({action})");
            let _ = reply.send(CommissionResponse::fail(
                rn,
                action,
                format!("duplicate request number {rn}"),
            ));
            continue;
        }
        last_rn = Some(rn);

        let response = match handler.handle(commission) {
            Outcome::Handled(response) => response,
            Outcome::Unhandled(_) => {
                log::error!("service {name}: unknown action {action}");
                CommissionResponse::fail(rn, action, format!("unknown action {action}"))
            }
        };
        if reply.send(response).is_err() {
            log::debug!("service {name}: response {rn} dropped by consumer");
        }
    }

    // Reject whatever is still queued.
    while let Ok(envelope) = rx.try_recv() {
        if let Envelope::Commission {
            commission, reply, ..
        } = envelope
        {
            let _ = reply.send(CommissionResponse::fail(
                commission.rn,
                commission.action(),
                "shutdown",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes get-signals requests; everything else is unhandled.
    struct EchoHandler;

    impl CommissionHandler for EchoHandler {
        fn handle(&mut self, commission: Commission) -> Outcome {
            match commission.payload {
                CommissionPayload::GetSignals { start, end } => Outcome::Handled(
                    CommissionResponse::ok(
                        commission.rn,
                        ActionKind::GetSignals,
                        ResponsePayload::DataDuration(end - start),
                    ),
                ),
                _ => Outcome::Unhandled(commission),
            }
        }
    }

    #[test]
    fn round_trip_and_rn_progression() {
        let service = ServiceHandle::spawn("echo", EchoHandler);

        let first = service.commission(CommissionPayload::GetSignals { start: 0.0, end: 2.0 });
        let second = service.commission(CommissionPayload::GetSignals { start: 0.0, end: 5.0 });
        assert!(second.rn() > first.rn());

        let got = first.wait();
        assert!(got.success);
        assert!(matches!(got.payload, ResponsePayload::DataDuration(d) if d == 2.0));
        assert!(second.wait().success);
    }

    #[test]
    fn duplicate_rn_is_rejected() {
        let service = ServiceHandle::spawn("echo", EchoHandler);
        let a = service.commission_with_rn(7, CommissionPayload::GetSignals { start: 0.0, end: 1.0 });
        assert!(a.wait().success);

        let dup = service.commission_with_rn(7, CommissionPayload::GetSignals { start: 0.0, end: 1.0 });
        let got = dup.wait();
        assert!(!got.success);
        assert!(got.reason.unwrap().contains("duplicate"));
    }

    #[test]
    fn unknown_actions_are_protocol_failures() {
        let service = ServiceHandle::spawn("echo", EchoHandler);
        let got = service.commission(CommissionPayload::MapChannels).wait();
        assert!(!got.success);
        assert!(matches!(
            got.into_result(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn shutdown_rejects_queued_commissions() {
        // A handler slow enough that commissions pile up behind it.
        struct SlowHandler;
        impl CommissionHandler for SlowHandler {
            fn handle(&mut self, commission: Commission) -> Outcome {
                std::thread::sleep(Duration::from_millis(50));
                Outcome::Handled(CommissionResponse::ok(
                    commission.rn,
                    commission.action(),
                    ResponsePayload::None,
                ))
            }
        }

        let service = ServiceHandle::spawn("slow", SlowHandler);
        let first = service.commission(CommissionPayload::MapChannels);
        // Let the worker dequeue the first commission before shutdown begins.
        std::thread::sleep(Duration::from_millis(10));
        let queued = service.commission(CommissionPayload::MapChannels);
        drop(service); // sends Shutdown behind the queued commission

        assert!(first.wait().success);
        let got = queued.wait();
        assert!(!got.success);
        assert_eq!(got.reason.as_deref(), Some("shutdown"));
        assert!(matches!(got.into_result(), Err(Error::Cancelled("shutdown"))));
    }

    #[test]
    fn kebab_case_wire_names() {
        assert_eq!(ActionKind::SetupInputMutex.as_str(), "setup-input-mutex");
        assert_eq!(ActionKind::ReleaseAndRearrange.as_str(), "release-and-rearrange");
        assert_eq!(
            CommissionPayload::SetChannelFilter {
                channel: 0,
                kind: FilterKind::Notch,
                value: None
            }
            .action()
            .to_string(),
            "set-filters"
        );
    }
}
