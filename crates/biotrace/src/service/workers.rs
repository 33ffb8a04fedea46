//! The concrete service workers: memory manager, raw reader, montage processor, plus the
//! settings handler every service cascades into.
//!
//! Wiring convention: the coordinator spawns the memory service first, keeps its event
//! receiver, and hands every other worker a clone of the memory handle plus the shared buffer.
//! Cache allocation then flows as commissions (`set-buffer`, `release-cache`,
//! `release-and-rearrange`) instead of direct calls, so each worker stays single-threaded over
//! its own state.

use std::sync::Arc;

use signal_synchronization::SharedBuffer;

use crate::cache::OutputCache;
use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::montage::config::MontageConfig;
use crate::montage::MontageProcessor;
use crate::reader::decoder::FormatDecoder;
use crate::reader::source::SignalSource;
use crate::reader::RawSignalReader;
use crate::recording::channel::SourceChannel;
use crate::recording::interruption::InterruptionMap;
use crate::service::{
    ActionKind, Commission, CommissionHandler, CommissionPayload, CommissionResponse, Outcome,
    ResponsePayload, ServiceHandle,
};
use crate::settings::Settings;
use crate::unique_id::UniqueId;

/// Wrap a handler result into the wire shape, logging per the propagation policy: protocol and
/// state problems loudly, cancellations quietly.
fn finish(rn: u64, action: ActionKind, result: Result<ResponsePayload>) -> Outcome {
    Outcome::Handled(match result {
        Ok(payload) => CommissionResponse::ok(rn, action, payload),
        Err(Error::Cancelled(reason)) => {
            log::debug!("{action} cancelled: {reason}");
            CommissionResponse::fail(rn, action, "cancelled")
        }
        Err(err) => {
            log::error!("{action} failed: {err}");
            CommissionResponse::fail(rn, action, err.to_string())
        }
    })
}

/// The parent handler in every cascade: actions common to all services.
pub struct CommonWorker {
    pub settings: Settings,
}

impl CommonWorker {
    pub fn new() -> CommonWorker {
        CommonWorker {
            settings: Settings::new(),
        }
    }
}

impl Default for CommonWorker {
    fn default() -> Self {
        CommonWorker::new()
    }
}

impl CommissionHandler for CommonWorker {
    fn handle(&mut self, commission: Commission) -> Outcome {
        let rn = commission.rn;
        match commission.payload {
            CommissionPayload::UpdateSettings { entries } => {
                self.settings.update_many(entries);
                finish(rn, ActionKind::UpdateSettings, Ok(ResponsePayload::None))
            }
            payload => Outcome::Unhandled(Commission { rn, payload }),
        }
    }
}

/// The memory manager as a service.
pub struct MemoryWorker {
    manager: MemoryManager,
}

impl MemoryWorker {
    pub fn new(manager: MemoryManager) -> MemoryWorker {
        MemoryWorker { manager }
    }
}

impl CommissionHandler for MemoryWorker {
    fn handle(&mut self, commission: Commission) -> Outcome {
        let rn = commission.rn;
        match commission.payload {
            CommissionPayload::SetBuffer {
                owner,
                bytes,
                depends_on,
            } => {
                let result = self.manager.allocate(bytes, owner).and_then(|token| {
                    if let Some(dependency) = depends_on {
                        self.manager.add_dependency(owner, dependency)?;
                    }
                    Ok(ResponsePayload::Token(token))
                });
                finish(rn, ActionKind::SetBuffer, result)
            }
            CommissionPayload::ReleaseBuffer { owner } => {
                self.manager.release(owner);
                finish(rn, ActionKind::ReleaseCache, Ok(ResponsePayload::None))
            }
            CommissionPayload::ReleaseAndRearrange {
                ranges,
                acknowledge,
            } => {
                let result = self.manager.remove_ranges(&ranges).map(|_| {
                    if let Some(owner) = acknowledge {
                        self.manager.acknowledge_rearrange(owner);
                    }
                    ResponsePayload::None
                });
                finish(rn, ActionKind::ReleaseAndRearrange, result)
            }
            payload => Outcome::Unhandled(Commission { rn, payload }),
        }
    }
}

/// The raw reader as a service.
pub struct ReaderWorker<S, D> {
    reader: RawSignalReader<S, D>,
    memory: ServiceHandle,
    buffer: Arc<SharedBuffer>,
}

impl<S: SignalSource, D: FormatDecoder> ReaderWorker<S, D> {
    pub fn new(
        reader: RawSignalReader<S, D>,
        memory: ServiceHandle,
        buffer: Arc<SharedBuffer>,
    ) -> ReaderWorker<S, D> {
        ReaderWorker {
            reader,
            memory,
            buffer,
        }
    }

    fn setup_input_cache(&mut self) -> Result<ResponsePayload> {
        let owner = self.reader.cache_owner();
        let bytes = self.reader.cache_bytes_required()?;
        let allocated = self
            .memory
            .request(CommissionPayload::SetBuffer {
                owner,
                bytes,
                depends_on: None,
            })?;
        let ResponsePayload::Token(token) = allocated else {
            return Err(Error::Protocol("set-buffer answered without a token".into()));
        };
        let output = self.reader.install_cache(self.buffer.clone(), token)?;
        Ok(ResponsePayload::Cache {
            token: output,
            owner,
        })
    }
}

impl<S: SignalSource, D: FormatDecoder> CommissionHandler for ReaderWorker<S, D> {
    fn handle(&mut self, commission: Commission) -> Outcome {
        let rn = commission.rn;
        match commission.payload {
            CommissionPayload::SetupWorker => {
                let result = self
                    .reader
                    .setup()
                    .map(ResponsePayload::DataDuration);
                finish(rn, ActionKind::SetupWorker, result)
            }
            CommissionPayload::SetupInputCache => {
                let result = self.setup_input_cache();
                finish(rn, ActionKind::SetupInputCache, result)
            }
            CommissionPayload::CacheSignals => {
                let result = self.reader.cache_signals().map(|_| ResponsePayload::None);
                finish(rn, ActionKind::CacheSignals, result)
            }
            CommissionPayload::GetSignals { start, end } => {
                let result = self
                    .reader
                    .get_signals(start, end)
                    .map(ResponsePayload::Part);
                finish(rn, ActionKind::GetSignals, result)
            }
            CommissionPayload::ReleaseCache => {
                self.reader.release_cache();
                let result = self
                    .memory
                    .request(CommissionPayload::ReleaseBuffer {
                        owner: self.reader.cache_owner(),
                    })
                    .map(|_| ResponsePayload::None);
                finish(rn, ActionKind::ReleaseCache, result)
            }
            CommissionPayload::Rearrange { owner, new_start } => {
                let result = if owner == self.reader.cache_owner() {
                    self.reader.rebase_cache(new_start);
                    self.memory
                        .request(CommissionPayload::ReleaseAndRearrange {
                            ranges: Vec::new(),
                            acknowledge: Some(owner),
                        })
                        .map(|_| ResponsePayload::None)
                } else {
                    Err(Error::Protocol(format!(
                        "rearrange for foreign owner {owner}"
                    )))
                };
                finish(rn, ActionKind::ReleaseAndRearrange, result)
            }
            payload => Outcome::Unhandled(Commission { rn, payload }),
        }
    }
}

/// The montage processor as a service.
///
/// `setup-worker` delivers the recipe and recording facts, `setup-input-mutex` (or
/// `setup-input-shared-worker`) delivers the raw cache token, and only then can the processor
/// exist; the intermediate state lives here.
pub struct MontageWorker {
    memory: ServiceHandle,
    buffer: Arc<SharedBuffer>,
    pending: Option<PendingMontage>,
    processor: Option<MontageProcessor>,
    raw_owner: Option<UniqueId>,
}

struct PendingMontage {
    config: MontageConfig,
    channels: Vec<SourceChannel>,
    data_duration: f64,
    interruptions: InterruptionMap,
}

impl MontageWorker {
    pub fn new(memory: ServiceHandle, buffer: Arc<SharedBuffer>) -> MontageWorker {
        MontageWorker {
            memory,
            buffer,
            pending: None,
            processor: None,
            raw_owner: None,
        }
    }

    fn processor_mut(&mut self) -> Result<&mut MontageProcessor> {
        self.processor
            .as_mut()
            .ok_or_else(|| Error::State("montage worker has no input view yet".into()))
    }

    fn attach_input(
        &mut self,
        token: signal_synchronization::CacheToken,
        raw_owner: Option<UniqueId>,
    ) -> Result<ResponsePayload> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::State("setup-input before setup-worker".into()))?;

        let raw_view = OutputCache::new(self.buffer.clone(), token);
        self.processor = Some(MontageProcessor::new(
            pending.config,
            pending.channels,
            pending.data_duration,
            pending.interruptions,
            Box::new(raw_view),
        ));
        self.raw_owner = raw_owner;
        Ok(ResponsePayload::None)
    }

    fn setup_output_cache(&mut self) -> Result<ResponsePayload> {
        let raw_owner = self.raw_owner;
        let memory = self.memory.clone();
        let buffer = self.buffer.clone();

        let processor = self.processor_mut()?;
        let owner = processor.cache_owner();
        let bytes = processor.cache_bytes_required()?;
        let allocated = memory.request(CommissionPayload::SetBuffer {
            owner,
            bytes,
            depends_on: raw_owner,
        })?;
        let ResponsePayload::Token(token) = allocated else {
            return Err(Error::Protocol("set-buffer answered without a token".into()));
        };
        let output = processor.install_cache(buffer, token)?;
        Ok(ResponsePayload::Cache {
            token: output,
            owner,
        })
    }
}

impl CommissionHandler for MontageWorker {
    fn handle(&mut self, commission: Commission) -> Outcome {
        let rn = commission.rn;
        match commission.payload {
            CommissionPayload::SetupMontage {
                config,
                channels,
                data_duration,
                interruptions,
            } => {
                self.pending = Some(PendingMontage {
                    config,
                    channels,
                    data_duration,
                    interruptions: InterruptionMap::from_items(interruptions),
                });
                finish(rn, ActionKind::SetupWorker, Ok(ResponsePayload::None))
            }
            CommissionPayload::SetupInputMutex { token, raw_owner } => {
                let result = self.attach_input(token, raw_owner);
                finish(rn, ActionKind::SetupInputMutex, result)
            }
            CommissionPayload::SetupInputSharedWorker { token, raw_owner } => {
                let result = self.attach_input(token, raw_owner);
                finish(rn, ActionKind::SetupInputSharedWorker, result)
            }
            CommissionPayload::MapChannels => {
                let result = self
                    .processor_mut()
                    .map(|p| ResponsePayload::Warnings(p.map_channels()));
                finish(rn, ActionKind::MapChannels, result)
            }
            CommissionPayload::SetupInputCache => {
                let result = self.setup_output_cache();
                finish(rn, ActionKind::SetupInputCache, result)
            }
            CommissionPayload::GetSignals { start, end } => {
                let result = self
                    .processor_mut()
                    .and_then(|p| p.get_all_signals(start, end))
                    .map(ResponsePayload::Signals);
                finish(rn, ActionKind::GetSignals, result)
            }
            CommissionPayload::SetFilters { filters } => {
                let result = self.processor_mut().map(|p| {
                    p.set_filters(filters);
                    ResponsePayload::None
                });
                finish(rn, ActionKind::SetFilters, result)
            }
            CommissionPayload::SetChannelFilter {
                channel,
                kind,
                value,
            } => {
                let result = self
                    .processor_mut()
                    .and_then(|p| p.set_channel_filter(channel, kind, value))
                    .map(|_| ResponsePayload::None);
                finish(rn, ActionKind::SetFilters, result)
            }
            CommissionPayload::SetInterruptions { items } => {
                let result = self.processor_mut().map(|p| {
                    p.set_interruptions(InterruptionMap::from_items(items));
                    ResponsePayload::None
                });
                finish(rn, ActionKind::SetInterruptions, result)
            }
            CommissionPayload::ReleaseCache => {
                let result = match self.processor.as_mut() {
                    Some(processor) => {
                        processor.release_cache();
                        let owner = processor.cache_owner();
                        self.memory
                            .request(CommissionPayload::ReleaseBuffer { owner })
                            .map(|_| ResponsePayload::None)
                    }
                    None => Ok(ResponsePayload::None),
                };
                finish(rn, ActionKind::ReleaseCache, result)
            }
            CommissionPayload::Rearrange { owner, new_start } => {
                let memory = self.memory.clone();
                let result = match self.processor.as_mut() {
                    Some(processor) if processor.cache_owner() == owner => {
                        processor.rebase_cache(new_start);
                        memory
                            .request(CommissionPayload::ReleaseAndRearrange {
                                ranges: Vec::new(),
                                acknowledge: Some(owner),
                            })
                            .map(|_| ResponsePayload::None)
                    }
                    _ => Err(Error::Protocol(format!(
                        "rearrange for foreign owner {owner}"
                    ))),
                };
                finish(rn, ActionKind::ReleaseAndRearrange, result)
            }
            payload => Outcome::Unhandled(Commission { rn, payload }),
        }
    }
}
