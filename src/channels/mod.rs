//! Mailbox sources and the outbound SMTP sink.

pub mod gmail;
pub mod imap;
pub mod mime;
pub mod smtp;

use std::sync::Arc;

pub use gmail::GmailSource;
pub use imap::ImapSource;
pub use smtp::SmtpSink;

use crate::config::SourceConfig;
use crate::pipeline::MessageSource;

/// Build the configured message source.
pub fn create_source(config: &SourceConfig) -> Arc<dyn MessageSource> {
    match config {
        SourceConfig::Imap(imap) => Arc::new(ImapSource::new(imap.clone())),
        SourceConfig::Gmail(gmail) => Arc::new(GmailSource::new(gmail.clone())),
    }
}
