//! Inactivity cost engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tabkeeper_shared::InactivityConfig;
use tabkeeper_shared::types::UserId;
use tracing::{info, instrument, warn};

use super::types::{ChargedCost, InactivityScanReport};
use crate::ledger::{LedgerError, LedgerWriter, NewTransfer, TransferCause};
use crate::notify::{LedgerNotifier, NoopNotifier};
use crate::scan::{ScanFailure, SkipReason, finish};
use crate::store::{LedgerStore, LedgerTx};

enum Evaluation {
    Charged(ChargedCost),
    Skipped(SkipReason),
}

/// Charges the inactivity cost to users who stopped using their account.
pub struct InactivityEngine<S> {
    writer: LedgerWriter<S>,
    config: InactivityConfig,
    notifier: Arc<dyn LedgerNotifier>,
}

impl<S: LedgerStore> InactivityEngine<S> {
    /// Creates an engine that writes through `writer`.
    #[must_use]
    pub fn new(writer: LedgerWriter<S>, config: InactivityConfig) -> Self {
        Self {
            writer,
            config,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Sets the notifier told about every committed charge.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn LedgerNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Charges every candidate whose last activity is older than the
    /// threshold. A charged user is flagged and never charged again.
    #[instrument(skip(self))]
    pub async fn run(&self, dry_run: bool) -> Result<InactivityScanReport, LedgerError> {
        let now = self.writer.cache().clock().now();
        let before = now - self.config.threshold();
        let mut report = InactivityScanReport::new(now, dry_run);

        let candidates = {
            let mut tx = self.writer.cache().begin().await?;
            let candidates = tx.inactivity_candidates(before).await?;
            tx.rollback().await?;
            candidates
        };

        for user_id in candidates {
            report.examined += 1;
            match self.evaluate(user_id, before, dry_run).await {
                Ok(Evaluation::Charged(charged)) => {
                    if !dry_run
                        && let Err(error) = self.notifier.inactivity_charged(&charged).await
                    {
                        warn!(%user_id, %error, "Inactivity notification failed");
                        report.warnings.push(format!(
                            "notification for inactivity cost {} failed: {error}",
                            charged.cost.id
                        ));
                    }
                    report.processed.push(charged);
                }
                Ok(Evaluation::Skipped(reason)) => report.skipped.push((user_id, reason)),
                Err(error) => {
                    warn!(%user_id, %error, "Inactivity evaluation failed");
                    report.failures.push(ScanFailure { user_id, error });
                }
            }
        }

        info!(
            examined = report.examined,
            charged = report.processed.len(),
            failed = report.failures.len(),
            dry_run,
            "Inactivity scan finished"
        );
        Ok(report)
    }

    async fn evaluate(
        &self,
        user_id: UserId,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Evaluation, LedgerError> {
        let mut tx = self.writer.cache().begin().await?;
        tx.lock_user(user_id).await?;
        let account = tx
            .find_user(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;

        // Re-read under the lock: another run may have charged the user, or
        // the user may have become active again since the listing.
        let last_activity = tx.last_activity_at(user_id).await?;
        let Some(last_activity) = last_activity.filter(|last| {
            account.active && !account.inactive_notified && *last < before
        }) else {
            tx.rollback().await?;
            return Ok(Evaluation::Skipped(SkipReason::AlreadyProcessed));
        };

        let current = self.writer.cache().refresh_in(&mut tx, user_id).await?;
        if !current.amount.is_positive() {
            finish(tx, dry_run).await?;
            return Ok(Evaluation::Skipped(SkipReason::NoPositiveBalance));
        }

        let amount = current.amount.min(self.writer.cache().ledger().money(self.config.cost));
        let debit = NewTransfer::debit(user_id, amount, TransferCause::InactivityCost)
            .with_description("Administrative cost for an inactive account");
        self.writer.validate_transfer(&debit)?;
        let posted = self.writer.post_in(&mut tx, &debit).await?;

        let cost = tx
            .insert_inactivity_cost(
                user_id,
                posted.transfer.id,
                amount,
                posted.transfer.created_at,
            )
            .await?;
        tx.set_inactive_notified(user_id, true).await?;
        finish(tx, dry_run).await?;

        let balance_after = posted
            .balance_of(user_id)
            .map_or(current.amount - amount, |balance| balance.amount);
        info!(%user_id, %amount, %balance_after, dry_run, "Inactivity cost charged");

        Ok(Evaluation::Charged(ChargedCost {
            cost,
            last_activity,
            balance_after,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ledger::{BalanceCache, BalanceService};
    use crate::notify::MockLedgerNotifier;
    use crate::store::InMemoryLedgerStore;
    use chrono::{TimeDelta, TimeZone};
    use tabkeeper_shared::LedgerConfig;
    use tabkeeper_shared::types::Money;

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        clock: Arc<ManualClock>,
        writer: LedgerWriter<InMemoryLedgerStore>,
        balances: BalanceService<InMemoryLedgerStore>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 3, 1, 12, 0, 0).unwrap()
    }

    fn money(amount: i64) -> Money {
        LedgerConfig::default().money(amount)
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let cache = BalanceCache::new(Arc::clone(&store), LedgerConfig::default(), clock.clone());
        Fixture {
            writer: LedgerWriter::new(cache),
            balances: BalanceService::new(Arc::clone(&store), LedgerConfig::default()),
            store,
            clock,
        }
    }

    impl Fixture {
        fn engine(&self) -> InactivityEngine<InMemoryLedgerStore> {
            InactivityEngine::new(self.writer.clone(), InactivityConfig::default())
        }

        async fn user_with(&self, deposit: i64) -> UserId {
            let user = self.store.create_user(self.clock.now()).await;
            self.writer.record_deposit(user, money(deposit), user.0).await.unwrap();
            user
        }
    }

    #[tokio::test]
    async fn test_charges_after_threshold_only_once() {
        let fx = fixture();
        let user = fx.user_with(2500).await;
        let engine = fx.engine();

        fx.clock.advance(TimeDelta::days(1094));
        assert!(engine.run(false).await.unwrap().processed.is_empty());

        fx.clock.advance(TimeDelta::days(2));
        let report = engine.run(false).await.unwrap();
        assert_eq!(report.processed.len(), 1);
        let charged = &report.processed[0];
        assert_eq!(charged.cost.amount, money(1000));
        assert_eq!(charged.last_activity, start());
        assert_eq!(charged.balance_after, money(1500));
        assert_eq!(fx.balances.get_balance(user).await.unwrap().amount, money(1500));

        // The charge is not activity that resets the flag.
        fx.clock.advance(TimeDelta::days(2000));
        assert!(engine.run(false).await.unwrap().processed.is_empty());
    }

    #[tokio::test]
    async fn test_cost_capped_at_balance() {
        let fx = fixture();
        let user = fx.user_with(350).await;

        fx.clock.advance(TimeDelta::days(1100));
        let report = fx.engine().run(false).await.unwrap();
        assert_eq!(report.processed[0].cost.amount, money(350));
        assert_eq!(fx.balances.get_balance(user).await.unwrap().amount, money(0));
    }

    #[tokio::test]
    async fn test_skips_users_without_positive_balance() {
        let fx = fixture();
        let broke = fx.store.create_user(start()).await;
        let indebted = fx.store.create_user(start()).await;
        fx.writer.record_payout(indebted, money(100), 1).await.unwrap();

        fx.clock.advance(TimeDelta::days(1100));
        let engine = fx.engine();
        let report = engine.run(false).await.unwrap();
        assert!(report.processed.is_empty());
        assert_eq!(
            report.skipped,
            vec![
                (broke, SkipReason::NoPositiveBalance),
                (indebted, SkipReason::NoPositiveBalance)
            ]
        );

        // Not flagged: a later deposit followed by inactivity is charged.
        fx.writer.record_deposit(broke, money(500), 1).await.unwrap();
        fx.clock.advance(TimeDelta::days(1100));
        let report = engine.run(false).await.unwrap();
        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.processed[0].cost.user_id, broke);
    }

    #[tokio::test]
    async fn test_recent_activity_and_inactive_accounts_are_ignored() {
        let fx = fixture();
        let old = fx.user_with(2000).await;
        let disabled = fx.user_with(2000).await;
        fx.store.set_user_active(disabled, false).await.unwrap();

        fx.clock.advance(TimeDelta::days(1000));
        let recent = fx.user_with(2000).await;
        fx.writer.record_payout(old, money(10), 1).await.unwrap();

        fx.clock.advance(TimeDelta::days(200));
        let report = fx.engine().run(false).await.unwrap();
        assert_eq!(report.examined, 0);

        fx.clock.advance(TimeDelta::days(1000));
        let report = fx.engine().run(false).await.unwrap();
        let charged: Vec<UserId> = report.processed.iter().map(|c| c.cost.user_id).collect();
        assert_eq!(charged, vec![old, recent]);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_flag_and_balance() {
        let fx = fixture();
        let user = fx.user_with(2500).await;
        fx.clock.advance(TimeDelta::days(1100));

        let mut notifier = MockLedgerNotifier::new();
        notifier.expect_inactivity_charged().times(0);
        let engine = fx.engine().with_notifier(Arc::new(notifier));

        let report = engine.run(true).await.unwrap();
        assert_eq!(report.processed.len(), 1);
        assert_eq!(fx.balances.get_balance(user).await.unwrap().amount, money(2500));

        let mut tx = fx.store.begin().await.unwrap();
        assert!(!tx.find_user(user).await.unwrap().unwrap().inactive_notified);
    }

    #[tokio::test]
    async fn test_notifier_failure_is_a_warning() {
        let fx = fixture();
        let user = fx.user_with(2500).await;
        fx.clock.advance(TimeDelta::days(1100));

        let mut notifier = MockLedgerNotifier::new();
        notifier
            .expect_inactivity_charged()
            .times(1)
            .returning(|_| Err(LedgerError::ExternalDependency("mail server down".into())));
        let report = fx
            .engine()
            .with_notifier(Arc::new(notifier))
            .run(false)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(fx.balances.get_balance(user).await.unwrap().amount, money(1500));
    }
}
