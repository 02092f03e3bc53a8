//! Equipment groups: named sets of equipment whose debts are tracked and
//! paid together.

use std::sync::Arc;

use bson::{doc, Bson};
use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use ledger_core::error::AppError;
use ledger_core::gate::OperationGate;
use ledger_core::retry::{retry_store_call, RetryConfig};

use crate::models::group::dedup_members;
use crate::models::{CreateGroup, Group, InvoiceStatus, UpdateGroup, BALANCE_EPSILON};
use crate::services::accounts::AccountAggregator;
use crate::services::metrics::STORE_OP_DURATION;
use crate::services::commit_ops;
use crate::store::{collections, BatchOp, DocumentStore, Filter};

/// Group lifecycle. Membership is exclusive across active groups, and the
/// group's open invoices carry a back-link that allocation and deletion
/// lean on.
pub struct GroupRegistry {
    store: Arc<dyn DocumentStore>,
    gate: OperationGate,
    retry: RetryConfig,
    accounts: Arc<AccountAggregator>,
}

impl GroupRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gate: OperationGate,
        retry: RetryConfig,
        accounts: Arc<AccountAggregator>,
    ) -> Self {
        Self {
            store,
            gate,
            retry,
            accounts,
        }
    }

    /// Create a group from the members that currently owe something.
    /// Members with no outstanding balance are dropped up front.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_group(&self, input: CreateGroup) -> Result<Group, AppError> {
        let _guard = self.gate.acquire("create_group").await?;

        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Group name must not be blank"
            )));
        }

        let members = dedup_members(input.equipment_ids);
        if members.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "A group needs at least one equipment id"
            )));
        }

        // Membership decisions read the live aggregates.
        self.accounts.refresh(true).await?;

        let kept: Vec<String> = members
            .into_iter()
            .filter(|m| self.accounts.members_owe(std::slice::from_ref(m)))
            .collect();
        if kept.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "None of the equipment ids have an outstanding balance"
            )));
        }

        self.ensure_members_unclaimed(&kept, None).await?;

        let timer = STORE_OP_DURATION
            .with_label_values(&["create_group"])
            .start_timer();

        let cached_total = self.accounts.total_for_members(&kept);
        let now = Utc::now();
        let group = Group {
            id: Uuid::new_v4(),
            name,
            equipment_ids: kept,
            cached_total,
            active: true,
            created_at: now,
            updated_at: now,
        };

        let mut ops = vec![BatchOp::Insert {
            collection: collections::GROUPS,
            doc: group.to_document()?,
        }];
        ops.extend(self.link_ops(group.id, &group.equipment_ids).await?);
        commit_ops(&self.store, &self.retry, ops, "create_group").await?;
        timer.observe_duration();

        info!(
            group_id = %group.id,
            members = group.equipment_ids.len(),
            cached_total = %group.cached_total,
            "Group created"
        );

        self.accounts.refresh(true).await?;
        Ok(group)
    }

    /// Replace a group's name and membership. Back-links follow the
    /// membership change: removed members are unlinked, added ones linked.
    #[instrument(skip(self, input), fields(group_id = %id))]
    pub async fn update_group(&self, id: Uuid, input: UpdateGroup) -> Result<Group, AppError> {
        let _guard = self.gate.acquire("update_group").await?;

        let mut group = self.load_group(id).await?;

        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "Group name must not be blank"
            )));
        }

        let members = dedup_members(input.equipment_ids);
        if members.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "A group needs at least one equipment id"
            )));
        }

        self.accounts.refresh(true).await?;

        let kept: Vec<String> = members
            .into_iter()
            .filter(|m| self.accounts.members_owe(std::slice::from_ref(m)))
            .collect();
        if kept.is_empty() {
            return Err(AppError::Validation(anyhow::anyhow!(
                "None of the equipment ids have an outstanding balance"
            )));
        }

        self.ensure_members_unclaimed(&kept, Some(id)).await?;

        let removed: Vec<String> = group
            .equipment_ids
            .iter()
            .filter(|m| !kept.contains(m))
            .cloned()
            .collect();
        let added: Vec<String> = kept
            .iter()
            .filter(|m| !group.equipment_ids.contains(m))
            .cloned()
            .collect();

        group.name = name;
        group.equipment_ids = kept;
        group.cached_total = self.accounts.total_for_members(&group.equipment_ids);
        group.updated_at = Utc::now();

        let mut ops = vec![BatchOp::Update {
            collection: collections::GROUPS,
            id: group.id.to_string(),
            patch: group.to_patch()?,
        }];
        ops.extend(self.unlink_ops(group.id, &removed).await?);
        // Re-link every current member; this also catches invoices written
        // since the group was created.
        ops.extend(self.link_ops(group.id, &group.equipment_ids).await?);
        commit_ops(&self.store, &self.retry, ops, "update_group").await?;

        info!(
            group_id = %group.id,
            members = group.equipment_ids.len(),
            added = added.len(),
            removed = removed.len(),
            "Group updated"
        );

        self.accounts.refresh(true).await?;
        Ok(group)
    }

    /// Delete a group and clear the back-link from every invoice that still
    /// points at it. Invoices and payments are untouched.
    #[instrument(skip(self), fields(group_id = %id))]
    pub async fn delete_group(&self, id: Uuid) -> Result<(), AppError> {
        let _guard = self.gate.acquire("delete_group").await?;

        let group = self.load_group(id).await?;

        let filters = [Filter::eq("group_id", id.to_string())];
        let docs = retry_store_call(&self.retry, "group_linked_invoices", || {
            self.store.query(collections::INVOICES, &filters)
        })
        .await?;

        let mut ops: Vec<BatchOp> = docs
            .iter()
            .filter_map(|doc| doc.get_str("_id").ok())
            .map(|invoice_id| BatchOp::Update {
                collection: collections::INVOICES,
                id: invoice_id.to_string(),
                patch: doc! { "group_id": Bson::Null },
            })
            .collect();
        let unlinked = ops.len();
        ops.push(BatchOp::Delete {
            collection: collections::GROUPS,
            id: id.to_string(),
        });

        commit_ops(&self.store, &self.retry, ops, "delete_group").await?;

        info!(group = %group.name, unlinked, "Group deleted");

        self.accounts.refresh(true).await?;
        Ok(())
    }

    /// Active groups that still have something outstanding, by name.
    pub async fn groups_with_balance(&self) -> Result<Vec<Group>, AppError> {
        let mut groups = self.active_groups().await?;
        groups.retain(|group| group.cached_total > BALANCE_EPSILON);
        groups.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(groups)
    }

    /// Normalized member ids of a group.
    pub async fn members_of(&self, id: Uuid) -> Result<Vec<String>, AppError> {
        Ok(self.load_group(id).await?.equipment_ids)
    }

    async fn load_group(&self, id: Uuid) -> Result<Group, AppError> {
        let id_str = id.to_string();
        let doc = retry_store_call(&self.retry, "get_group", || {
            self.store.get(collections::GROUPS, &id_str)
        })
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Group {id} does not exist")))?;
        Ok(Group::from_document(doc)?)
    }

    /// All active groups. The flag is filtered after decoding: groups
    /// written before it existed carry no field for a store-level match.
    async fn active_groups(&self) -> Result<Vec<Group>, AppError> {
        let docs = retry_store_call(&self.retry, "load_groups", || {
            self.store.query(collections::GROUPS, &[])
        })
        .await?;

        let mut groups = docs
            .into_iter()
            .map(Group::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        groups.retain(|group| group.active);
        Ok(groups)
    }

    /// Equipment can belong to at most one active group.
    async fn ensure_members_unclaimed(
        &self,
        members: &[String],
        exclude: Option<Uuid>,
    ) -> Result<(), AppError> {
        for group in self.active_groups().await? {
            if exclude == Some(group.id) {
                continue;
            }
            if let Some(member) = members.iter().find(|m| group.contains_equipment(m)) {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Equipment {} already belongs to group '{}'",
                    member,
                    group.name
                )));
            }
        }
        Ok(())
    }

    /// Updates that point every member's open invoices at the group.
    async fn link_ops(
        &self,
        group_id: Uuid,
        members: &[String],
    ) -> Result<Vec<BatchOp>, AppError> {
        let mut ops = Vec::new();
        for member in members {
            let filters = [
                Filter::eq("equipment_id", member.as_str()),
                Filter::eq("status", InvoiceStatus::Open.as_str()),
            ];
            let docs = retry_store_call(&self.retry, "member_open_invoices", || {
                self.store.query(collections::INVOICES, &filters)
            })
            .await?;

            for doc in docs {
                if let Ok(invoice_id) = doc.get_str("_id") {
                    ops.push(BatchOp::Update {
                        collection: collections::INVOICES,
                        id: invoice_id.to_string(),
                        patch: doc! { "group_id": group_id.to_string() },
                    });
                }
            }
        }
        Ok(ops)
    }

    /// Updates that clear the back-link on invoices of removed members.
    async fn unlink_ops(
        &self,
        group_id: Uuid,
        removed: &[String],
    ) -> Result<Vec<BatchOp>, AppError> {
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let filters = [Filter::eq("group_id", group_id.to_string())];
        let docs = retry_store_call(&self.retry, "group_linked_invoices", || {
            self.store.query(collections::INVOICES, &filters)
        })
        .await?;

        let mut ops = Vec::new();
        for doc in docs {
            let equipment = doc.get_str("equipment_id").unwrap_or_default();
            if removed.iter().any(|m| m == equipment) {
                if let Ok(invoice_id) = doc.get_str("_id") {
                    ops.push(BatchOp::Update {
                        collection: collections::INVOICES,
                        id: invoice_id.to_string(),
                        patch: doc! { "group_id": Bson::Null },
                    });
                }
            }
        }
        Ok(ops)
    }
}
