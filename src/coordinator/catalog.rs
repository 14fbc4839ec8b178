// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Privileged catalog edits.

use tracing::{info, warn};

use super::{OptionResult, RedemptionCoordinator};
use crate::error::LedgerResult;
use crate::model::{now_millis, RedemptionOption};
use crate::remote::traits::RemoteLedger;

impl RedemptionCoordinator {
    /// Create or replace a catalog entry; queued when the ledger is unreachable.
    #[tracing::instrument(skip(self, option), fields(option_id = %option.id))]
    pub async fn save_option(&self, option: RedemptionOption) -> LedgerResult<OptionResult> {
        option.validate()?;

        match self.remote.upsert_option(&option).await {
            Ok(saved) => {
                if let Err(e) = self.cache.confirm_option(&saved).await {
                    warn!(error = %e, "Failed to cache saved option");
                }
                info!(version = saved.version, "Option saved");
                Ok(OptionResult { option: saved, pending_sync: false })
            }
            Err(e) if e.is_transient() => {
                let is_new = self.cache.get_option(&option.id).await?.is_none();
                let mut local = option;
                local.updated_at = now_millis();
                let seq = self.queue.enqueue_option_upsert(&local, is_new).await?;
                warn!(error = %e, seq, is_new, "Remote ledger unavailable, option save queued");
                Ok(OptionResult { option: local, pending_sync: true })
            }
            Err(e) => Err(e),
        }
    }

    /// Deactivate a catalog entry. Existing transactions keep their title.
    #[tracing::instrument(skip(self))]
    pub async fn archive_option(&self, option_id: &str) -> LedgerResult<OptionResult> {
        match self.remote.archive_option(option_id).await {
            Ok(archived) => {
                if let Err(e) = self.cache.confirm_option(&archived).await {
                    warn!(error = %e, "Failed to cache archived option");
                }
                info!("Option archived");
                Ok(OptionResult { option: archived, pending_sync: false })
            }
            Err(e) if e.is_transient() => {
                let mut local = match self.cache.get_option(option_id).await? {
                    Some(cached) => cached.value,
                    None => return Err(e),
                };
                local.is_active = false;
                local.updated_at = now_millis();
                let seq = self.queue.enqueue_option_archive(&local).await?;
                warn!(error = %e, seq, "Remote ledger unavailable, archive queued");
                Ok(OptionResult { option: local, pending_sync: true })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use crate::config::LedgerConfig;
    use crate::error::LedgerError;
    use crate::model::{EntityType, OperationKind, RedemptionOption, SyncStatus};
    use crate::remote::traits::RemoteLedger;

    #[tokio::test]
    async fn test_save_option_online() {
        let h = harness(LedgerConfig::default()).await;
        let saved = h
            .coordinator
            .save_option(RedemptionOption::new("zoo", "Zoo visit", 400).with_category("outing"))
            .await
            .unwrap();
        assert!(!saved.pending_sync);
        assert_eq!(h.ledger.get_option("zoo").await.unwrap().title, "Zoo visit");

        let cached = h.coordinator.cache().get_option("zoo").await.unwrap().unwrap();
        assert_eq!(cached.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_invalid_option_rejected() {
        let h = harness(LedgerConfig::default()).await;
        let err = h.coordinator.save_option(RedemptionOption::new("bad", "Bad", 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(h.ledger.call_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_option_edits_replay() {
        let h = harness(LedgerConfig::default()).await;
        let c = &h.coordinator;
        c.redemption_options(&Default::default(), Default::default(), Default::default()).await.unwrap();
        h.ledger.set_online(false);

        let created = c.save_option(RedemptionOption::new("zoo", "Zoo visit", 400)).await.unwrap();
        assert!(created.pending_sync);
        let queued = c.queue().pending_for(EntityType::Option, "zoo").await.unwrap();
        assert_eq!(queued[0].kind, OperationKind::Create);

        let archived = c.archive_option("movie").await.unwrap();
        assert!(archived.pending_sync);
        assert!(!archived.option.is_active);

        assert!(c.archive_option("never-seen").await.unwrap_err().is_connectivity());

        h.ledger.set_online(true);
        let report = c.sync_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(h.ledger.get_option("zoo").await.is_ok());
        assert!(!h.ledger.get_option("movie").await.unwrap().is_active);
    }
}
