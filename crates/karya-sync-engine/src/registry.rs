//! Table registry and per-table merge handlers.
//!
//! Every syncable table is registered once, in dependency order (parents
//! first), together with its authority and the handler that knows how to
//! fold an incoming row into the stored one. Adding a table means adding a
//! [`TableSpec`]; nothing else in the engine switches on table names.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use karya_sync_core::record::ID_FIELD;
use karya_sync_core::{
    AssignmentStatus, Checksum, CoreError, FileRecord, PeerId, Record, TableName, Tier, Timestamp,
};
use karya_sync_store::RecordScope;

/// Which tiers create and may change rows of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub creator: Tier,
    pub mutators: Vec<Tier>,
}

impl Authority {
    pub fn new(creator: Tier, mutators: impl IntoIterator<Item = Tier>) -> Self {
        Self {
            creator,
            mutators: mutators.into_iter().collect(),
        }
    }

    /// Rows are only created and changed centrally.
    pub fn central() -> Self {
        Self::new(Tier::Central, [Tier::Central])
    }

    /// Rows may be changed on every tier.
    pub fn shared(creator: Tier) -> Self {
        Self::new(creator, [Tier::Central, Tier::Edge, Tier::Client])
    }

    /// Whether `tier` may change rows of this table.
    pub fn allows(&self, tier: Tier) -> bool {
        self.creator == tier || self.mutators.contains(&tier)
    }

    /// Whether `local` should accept rows of this table from `sender`.
    ///
    /// Rows flowing down from an upstream tier are always accepted; rows
    /// pushed up are accepted only from a mutator.
    pub fn accepts(&self, sender: Tier, local: Tier) -> bool {
        sender.is_above(local) || self.allows(sender)
    }
}

/// Who is merging and who sent the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeContext {
    pub local: Tier,
    pub sender: Tier,
}

impl MergeContext {
    /// The sender is this node's upstream peer.
    pub fn from_upstream(&self) -> bool {
        self.sender.is_above(self.local)
    }
}

/// Table-specific merge behavior.
pub trait TableHandler: Send + Sync + fmt::Debug {
    /// Fold an incoming row into the stored one.
    ///
    /// Only called when `incoming` is new or strictly newer than `existing`.
    fn merge(
        &self,
        ctx: &MergeContext,
        existing: Option<&Record>,
        incoming: Record,
    ) -> Result<Record, CoreError>;

    /// Local follow-up once the peer has accepted `row`.
    ///
    /// Returns the row to store, or `None` to leave it alone. Implementations
    /// must not touch `last_updated_at`.
    fn mark_sent(&self, _row: &Record, _now: Timestamp) -> Result<Option<Record>, CoreError> {
        Ok(None)
    }
}

/// Newer row replaces the stored one.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainUpsert;

impl TableHandler for PlainUpsert {
    fn merge(
        &self,
        _ctx: &MergeContext,
        _existing: Option<&Record>,
        incoming: Record,
    ) -> Result<Record, CoreError> {
        Ok(incoming)
    }
}

/// Assignments whose status only moves forward.
///
/// A newer row that would move the status backward keeps the stored status.
/// After a successful send, `completed` rows become `submitted`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentHandler;

/// Field stamped when a completed assignment is handed upstream.
pub const SUBMITTED_TO_SERVER_AT: &str = "submitted_to_server_at";

impl TableHandler for AssignmentHandler {
    fn merge(
        &self,
        _ctx: &MergeContext,
        existing: Option<&Record>,
        mut incoming: Record,
    ) -> Result<Record, CoreError> {
        let Some(existing) = existing else {
            incoming.status()?;
            return Ok(incoming);
        };

        if let (Some(old), Some(new)) = (existing.status()?, incoming.status()?) {
            if old.regresses_to(new) {
                tracing::debug!(
                    from = %old,
                    to = %new,
                    "keeping assignment status, incoming row would regress it"
                );
                incoming.set("status", Value::String(old.as_str().to_string()));
                if let Some(at) = existing.get(SUBMITTED_TO_SERVER_AT) {
                    if incoming.get(SUBMITTED_TO_SERVER_AT).map_or(true, Value::is_null) {
                        incoming.set(SUBMITTED_TO_SERVER_AT, at.clone());
                    }
                }
            }
        }

        Ok(incoming)
    }

    fn mark_sent(&self, row: &Record, now: Timestamp) -> Result<Option<Record>, CoreError> {
        if row.status()? != Some(AssignmentStatus::Completed) {
            return Ok(None);
        }

        let mut row = row.clone();
        row.set(
            "status",
            Value::String(AssignmentStatus::Submitted.as_str().to_string()),
        );
        row.set(SUBMITTED_TO_SERVER_AT, Value::String(now.to_rfc3339()));
        Ok(Some(row))
    }
}

/// File metadata with per-tier presence flags.
///
/// `present_locally` and `url` describe this node's copy and survive a merge
/// unless the checksum changed. `present_remotely` follows the sender's
/// `present_locally` when the sender is upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileRecordHandler;

fn same_content(a: &FileRecord, b: &FileRecord) -> bool {
    if a.algorithm != b.algorithm {
        return false;
    }
    match Checksum::parse(a.algorithm, &a.checksum) {
        Ok(sum) => sum.matches(&b.checksum),
        Err(_) => a.checksum == b.checksum,
    }
}

impl TableHandler for FileRecordHandler {
    fn merge(
        &self,
        ctx: &MergeContext,
        existing: Option<&Record>,
        incoming: Record,
    ) -> Result<Record, CoreError> {
        let mut file = FileRecord::try_from(incoming)?;
        let sender_has_bytes = file.present_locally;
        let existing = existing.map(FileRecord::try_from).transpose()?;

        match existing {
            Some(old) if same_content(&old, &file) => {
                file.present_locally = old.present_locally;
                file.url = old.url;
                file.present_remotely = if ctx.from_upstream() {
                    sender_has_bytes
                } else {
                    old.present_remotely
                };
            }
            _ => {
                file.present_locally = false;
                file.url = None;
                file.present_remotely = ctx.from_upstream() && sender_has_bytes;
            }
        }

        file.to_record()
    }
}

/// Column naming the box a row belongs to.
pub const BOX_ID: &str = "box_id";
/// Column naming the worker, and so the phone, a row belongs to.
pub const WORKER_ID: &str = "worker_id";

/// One registered table.
///
/// `scopes` name, per downstream tier, the column holding the id of the
/// node a row belongs to. A downstream node is served, and may change, only
/// rows whose column is empty or holds its own id.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: TableName,
    pub authority: Authority,
    pub handler: Arc<dyn TableHandler>,
    pub scopes: Vec<(Tier, &'static str)>,
}

impl TableSpec {
    pub fn new(name: TableName, authority: Authority, handler: Arc<dyn TableHandler>) -> Self {
        Self {
            name,
            authority,
            handler,
            scopes: Vec::new(),
        }
    }

    /// Limit what a node of `tier` sees and changes to rows owned through `column`.
    pub fn scoped(mut self, tier: Tier, column: &'static str) -> Self {
        self.scopes.retain(|(t, _)| *t != tier);
        self.scopes.push((tier, column));
        self
    }

    pub fn scope_column(&self, tier: Tier) -> Option<&'static str> {
        self.scopes
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, column)| *column)
    }

    /// The rows of this table visible to `peer`, a node of `tier`.
    pub fn scope_for(&self, tier: Tier, peer: &PeerId) -> Option<RecordScope> {
        self.scope_column(tier)
            .map(|column| RecordScope::new(column, peer.as_str()))
    }
}

/// Ordered set of syncable tables.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    specs: Vec<TableSpec>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The Karya tables in dependency order.
    pub fn standard() -> Self {
        let plain: Arc<dyn TableHandler> = Arc::new(PlainUpsert);
        let assignment: Arc<dyn TableHandler> = Arc::new(AssignmentHandler);

        Self::new()
            .with(
                TableSpec::new(TableName::WORKER, Authority::shared(Tier::Edge), plain.clone())
                    .scoped(Tier::Client, ID_FIELD)
                    .scoped(Tier::Edge, BOX_ID),
            )
            .with(
                TableSpec::new(
                    TableName::KARYA_FILE,
                    Authority::shared(Tier::Client),
                    Arc::new(FileRecordHandler),
                )
                .scoped(Tier::Client, WORKER_ID)
                .scoped(Tier::Edge, BOX_ID),
            )
            .with(TableSpec::new(TableName::TASK, Authority::central(), plain.clone()))
            .with(
                TableSpec::new(TableName::TASK_ASSIGNMENT, Authority::central(), plain.clone())
                    .scoped(Tier::Edge, BOX_ID),
            )
            .with(TableSpec::new(TableName::MICROTASK_GROUP, Authority::central(), plain.clone()))
            .with(TableSpec::new(TableName::MICROTASK, Authority::central(), plain))
            .with(
                TableSpec::new(
                    TableName::MICROTASK_GROUP_ASSIGNMENT,
                    Authority::shared(Tier::Edge),
                    assignment.clone(),
                )
                .scoped(Tier::Client, WORKER_ID)
                .scoped(Tier::Edge, BOX_ID),
            )
            .with(
                TableSpec::new(
                    TableName::MICROTASK_ASSIGNMENT,
                    Authority::shared(Tier::Edge),
                    assignment,
                )
                .scoped(Tier::Client, WORKER_ID)
                .scoped(Tier::Edge, BOX_ID),
            )
    }

    /// Append a table after all registered ones. Replaces a spec of the same name in place.
    pub fn with(mut self, spec: TableSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn register(&mut self, spec: TableSpec) {
        match self.specs.iter_mut().find(|s| s.name == spec.name) {
            Some(slot) => *slot = spec,
            None => self.specs.push(spec),
        }
    }

    pub fn get(&self, name: &TableName) -> Option<&TableSpec> {
        self.specs.iter().find(|s| &s.name == name)
    }

    /// Position in dependency order.
    pub fn position(&self, name: &TableName) -> Option<usize> {
        self.specs.iter().position(|s| &s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSpec> {
        self.specs.iter()
    }

    pub fn names(&self) -> Vec<TableName> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Tables whose rows `tier` may change, in dependency order.
    pub fn mutable_by(&self, tier: Tier) -> impl Iterator<Item = &TableSpec> {
        self.specs.iter().filter(move |s| s.authority.allows(tier))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
