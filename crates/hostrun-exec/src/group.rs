//! Fan-out of one command over many connections

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectOptions;
use crate::connection::{Connection, Operation};
use crate::error::ExecError;
use crate::options::RunOptions;
use crate::result::CommandResult;
use crate::target::{Endpoint, TargetId};
use crate::traits::Providers;

/// Default number of members executing at once
pub const DEFAULT_CONCURRENCY: usize = 10;

/// One Group member and its aggregation key
#[derive(Debug, Clone)]
pub struct Member {
    id: TargetId,
    connection: Arc<Connection>,
}

impl Member {
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

/// Ordered, fixed set of connections
#[derive(Debug)]
pub struct Group {
    members: Vec<Member>,
    concurrency: usize,
}

impl Group {
    /// Build a group; members sharing an endpoint get increasing ordinals
    pub fn new(connections: impl IntoIterator<Item = Connection>) -> Self {
        let mut seen: HashMap<Endpoint, usize> = HashMap::new();
        let members = connections
            .into_iter()
            .map(|connection| {
                let endpoint = connection.endpoint().clone();
                let next = seen.entry(endpoint.clone()).or_insert(0);
                let ordinal = *next;
                *next += 1;
                Member {
                    id: TargetId { endpoint, ordinal },
                    connection: Arc::new(connection),
                }
            })
            .collect();

        Self {
            members,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Parse host strings into a group sharing one set of options
    ///
    /// # Errors
    /// Returns `ExecError::InvalidTarget` for the first unparsable host
    pub fn from_hosts<I, S>(hosts: I, options: &ConnectOptions) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_hosts_with_providers(hosts, options, &Providers::default())
    }

    /// Like [`Group::from_hosts`], with explicit providers
    ///
    /// # Errors
    /// Returns `ExecError::InvalidTarget` for the first unparsable host
    pub fn from_hosts_with_providers<I, S>(
        hosts: I,
        options: &ConnectOptions,
        providers: &Providers,
    ) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let connections = hosts
            .into_iter()
            .map(|host| {
                Connection::new(host.as_ref(), options.clone())
                    .map(|c| c.with_providers(providers.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(connections))
    }

    /// Set how many members execute at once (at least 1)
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in construction order
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    /// Run `command` on every member
    pub async fn run(&self, command: &str, options: &RunOptions) -> GroupResult {
        self.dispatch(Operation::Run, command, options).await
    }

    /// Run `command` locally once per member
    pub async fn local(&self, command: &str, options: &RunOptions) -> GroupResult {
        self.dispatch(Operation::Local, command, options).await
    }

    /// Run `command` through sudo on every member
    pub async fn sudo(&self, command: &str, options: &RunOptions) -> GroupResult {
        self.dispatch(Operation::Sudo, command, options).await
    }

    /// Fan `command` out in batches of `concurrency`
    ///
    /// Member errors become entries; this never fails as a whole.
    #[instrument(skip(self, options), fields(members = self.members.len(), op = %operation))]
    pub async fn dispatch(
        &self,
        operation: Operation,
        command: &str,
        options: &RunOptions,
    ) -> GroupResult {
        info!(
            total = self.members.len(),
            concurrency = self.concurrency,
            command = %command,
            "dispatching to group"
        );

        let mut entries = Vec::with_capacity(self.members.len());

        for batch in self.members.chunks(self.concurrency) {
            let mut handles = Vec::with_capacity(batch.len());

            for member in batch {
                let connection = Arc::clone(&member.connection);
                let command = command.to_string();
                let options = options.clone();

                let handle = tokio::spawn(async move {
                    connection.dispatch(operation, &command, &options).await
                });

                handles.push((member.id.clone(), handle));
            }

            // Wait for batch to complete, in member order
            for (id, handle) in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(target = %id, error = %e, "member task panicked");
                        Err(ExecError::SpawnError(format!("member task failed: {e}")))
                    }
                };
                match &outcome {
                    Ok(result) => debug!(target = %id, status = result.exited(), "member completed"),
                    Err(e) => warn!(target = %id, error = %e, "member failed"),
                }
                entries.push((id, outcome));
            }
        }

        let result = GroupResult::new(entries);
        info!(
            total = result.len(),
            succeeded = result.successes().count(),
            failed = result.failures().count(),
            "group dispatch finished"
        );
        result
    }

    /// Close every member's connection
    pub async fn close(&self) {
        for member in &self.members {
            member.connection.close().await;
        }
    }
}

impl Index<usize> for Group {
    type Output = Member;

    fn index(&self, index: usize) -> &Member {
        &self.members[index]
    }
}

/// Per-member outcomes of a Group call, keyed by [`TargetId`]
#[derive(Debug)]
pub struct GroupResult {
    entries: Vec<(TargetId, Result<CommandResult, ExecError>)>,
    index: HashMap<TargetId, usize>,
}

impl GroupResult {
    fn new(entries: Vec<(TargetId, Result<CommandResult, ExecError>)>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();
        Self { entries, index }
    }

    /// Outcome for one member
    pub fn get(&self, id: &TargetId) -> Option<&Result<CommandResult, ExecError>> {
        self.index.get(id).map(|&i| &self.entries[i].1)
    }

    /// Entries in Group construction order
    pub fn iter(&self) -> impl Iterator<Item = (&TargetId, &Result<CommandResult, ExecError>)> {
        self.entries.iter().map(|(id, outcome)| (id, outcome))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Members whose command exited 0
    pub fn successes(&self) -> impl Iterator<Item = (&TargetId, &CommandResult)> {
        self.entries.iter().filter_map(|(id, outcome)| match outcome {
            Ok(result) if result.ok() => Some((id, result)),
            _ => None,
        })
    }

    /// Members that recorded an error
    ///
    /// Nonzero exits returned under `warn` are neither successes nor failures.
    pub fn failures(&self) -> impl Iterator<Item = (&TargetId, &ExecError)> {
        self.entries.iter().filter_map(|(id, outcome)| match outcome {
            Err(e) => Some((id, e)),
            Ok(_) => None,
        })
    }

    /// True iff every entry is a successful result
    pub fn ok(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, outcome)| matches!(outcome, Ok(result) if result.ok()))
    }
}

impl Index<&TargetId> for GroupResult {
    type Output = Result<CommandResult, ExecError>;

    fn index(&self, id: &TargetId) -> &Self::Output {
        self.get(id)
            .unwrap_or_else(|| panic!("no entry for target {id}"))
    }
}

impl IntoIterator for GroupResult {
    type Item = (TargetId, Result<CommandResult, ExecError>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
