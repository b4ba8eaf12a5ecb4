//! Export pipelines.
//!
//! A pipeline is compiled from a registration into a fixed chain of stages:
//! filters, a formatter, an optional compressor, an optional encryptor and a sender.

mod filter;
mod format;
#[cfg(test)]
mod format_test;
mod transform;

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::models::{Compression, Destination, EncryptionAlgorithm, Event, ExportFormat, Registration};
use crate::sender::{Sender, SenderFactory};

use filter::{build_filters, Filter};
use format::{build_formatter, Formatter};
use transform::{build_compressor, AesEncryptor, Transformer};

/// Errors from compiling a registration into a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported export format '{0}'")]
    UnsupportedFormat(String),
    #[error("unsupported compression '{0}'")]
    UnsupportedCompression(String),
    #[error("unsupported encryption algorithm '{0}'")]
    UnsupportedEncryption(String),
    #[error("unsupported destination '{0}'")]
    UnsupportedDestination(String),
    #[error("error building sender: {0:#}")]
    Sender(anyhow::Error),
}

/// The compiled pipeline of one registration.
pub struct Pipeline {
    filters: Vec<Box<dyn Filter>>,
    formatter: Box<dyn Formatter>,
    compressor: Option<Box<dyn Transformer>>,
    encryptor: Option<Box<dyn Transformer>>,
    sender: Arc<dyn Sender>,
    /// Whether successful sends are acknowledged back to core data.
    mark_pushed: bool,
    enabled: bool,
}

impl Pipeline {
    /// Compile the given registration into a new pipeline.
    ///
    /// Every stage is freshly constructed. Any unrecognized enum value or a sender construction
    /// failure fails the whole build.
    pub fn build(reg: &Registration, config: &Config, senders: &dyn SenderFactory) -> Result<Self, PipelineError> {
        let format: ExportFormat = reg.format.parse().map_err(PipelineError::UnsupportedFormat)?;
        let compression = Compression::parse_field(&reg.compression).map_err(PipelineError::UnsupportedCompression)?;
        let dest: Destination = reg.destination.parse().map_err(PipelineError::UnsupportedDestination)?;
        let algo = EncryptionAlgorithm::parse_field(&reg.encryption.algo).map_err(PipelineError::UnsupportedEncryption)?;

        let encryptor: Option<Box<dyn Transformer>> = match algo {
            EncryptionAlgorithm::Aes => Some(Box::new(AesEncryptor::new(&reg.encryption))),
            EncryptionAlgorithm::None => {
                if !reg.encryption.key.is_empty() || !reg.encryption.init_vector.is_empty() {
                    tracing::warn!(registration = %reg.name, "encryption key or IV given without an encryption algorithm, payloads will not be encrypted");
                }
                None
            }
        };
        let sender = senders.build(config, reg, dest).map_err(PipelineError::Sender)?;

        Ok(Self {
            filters: build_filters(&reg.filter),
            formatter: build_formatter(format),
            compressor: build_compressor(compression),
            encryptor,
            sender,
            mark_pushed: reg.mark_pushed.unwrap_or(config.mark_pushed),
            enabled: reg.enable,
        })
    }

    /// Run the filter chain over the given event, yielding the event to export if accepted.
    pub fn filter(&self, event: Arc<Event>) -> Option<Arc<Event>> {
        let mut current = Some(event);
        for filter in self.filters.iter() {
            let (accepted, next) = filter.apply(current);
            if !accepted {
                return None;
            }
            current = next;
        }
        current
    }

    /// Format, compress and encrypt the given event.
    ///
    /// Yields `None` when there is nothing to send, either because the formatted payload is
    /// empty or because a transformation failed.
    pub fn encode(&self, event: &Event) -> Option<Vec<u8>> {
        let mut payload = self.formatter.format(event);
        if payload.is_empty() {
            return None;
        }
        for stage in self.compressor.iter().chain(self.encryptor.iter()) {
            payload = match stage.transform(&payload) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(error = ?err, "error transforming payload");
                    return None;
                }
            };
        }
        Some(payload)
    }

    /// Send the given payload through this pipeline's sender.
    pub async fn send(&self, payload: &[u8], event: Option<&Event>) -> bool {
        self.sender.send(payload, event).await
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn mark_pushed(&self) -> bool {
        self.mark_pushed
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}
