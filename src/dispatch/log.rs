//! Writes alerts to the daemon log.

use async_trait::async_trait;
use tracing::warn;

use super::{AlertMessage, Destination};
use crate::error::DispatchError;

pub struct LogDestination {
    name: String,
}

impl LogDestination {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Destination for LogDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertMessage) -> Result<(), DispatchError> {
        warn!(
            target: "elasticalert::alert",
            rule = %alert.rule,
            fingerprint = %alert.fingerprint,
            matches = alert.match_count,
            subject = %alert.subject,
            "{}",
            alert.text
        );
        Ok(())
    }
}
