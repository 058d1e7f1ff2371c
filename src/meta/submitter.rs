//! Mutation submitter
//!
//! Sends a command to the first server that accepts it, in list order. There
//! is no backoff; callers surface the error.

use super::command::Command;
use super::telemetry;
use super::transport::{CommandReceipt, MetaTransport};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct MutationSubmitter {
    transport: Arc<dyn MetaTransport>,
    servers: Arc<Vec<String>>,
}

impl MutationSubmitter {
    pub fn new(transport: Arc<dyn MetaTransport>, servers: Arc<Vec<String>>) -> Self {
        Self { transport, servers }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Submit `command` to each server in turn until one accepts it.
    ///
    /// Any failure, including a rejection from a server that is not the
    /// authority, moves on to the next server. The last error is returned once
    /// every server has failed.
    pub async fn submit(&self, command: &Command) -> Result<CommandReceipt> {
        let kind = command.kind();
        let mut last_err = Error::NoServers;

        for server in self.servers.iter() {
            match self.transport.submit(server, command).await {
                Ok(receipt) => {
                    debug!(server = %server, command = kind, index = ?receipt.index, "Command accepted");
                    telemetry::record_submit(kind, true);
                    return Ok(receipt);
                }
                Err(e) => {
                    warn!(server = %server, command = kind, error = %e, "Command submission failed, trying next server");
                    last_err = e;
                }
            }
        }

        telemetry::record_submit(kind, false);
        Err(last_err)
    }
}
