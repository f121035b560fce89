//! Custodial treasury ledger.
//!
//! Entries are append-only. A withdrawal is authorized against the
//! treasury's live on-chain balance net of every withdrawal still in
//! flight, re-read for every decision, and against the account's available
//! ledger balance. Withdrawals are serialized treasury-wide. The outbound
//! transfer is recorded `Pending` before it is dispatched, carries the
//! entry id as its idempotency reference and only settles once its receipt
//! is known.
//!
//! A deposit is confirmed only when its receipt shows a successful transfer
//! from the depositing account to the treasury of at least the claimed
//! amount.

use crate::chain::{ChainReader, Receipt, ReceiptStatus, TreasuryWallet};
use crate::errors::{lift_chain_error, TreasuryError, WagerResult};
use crate::metrics::WagerMetrics;
use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::store::SettlementStore;
use crate::types::{
    now_millis, Address, Amount, AuditRecord, AuditSeverity, EntryKind, EntryStatus, RequestId, TreasuryEntry, TxRef,
};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const ACCOUNT_LOCK_STRIPES: usize = 64;

/// A ledger entry joined to the status of its on-chain transaction.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciledEntry {
    pub entry: TreasuryEntry,
    /// `None` for internal entries and for transfers without a receipt yet.
    pub chain_status: Option<ReceiptStatus>,
    /// Ledger status disagrees with the receipt.
    pub mismatch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreasuryHealth {
    pub treasury: Address,
    pub on_chain_balance: Amount,
    /// Sum of every account's confirmed balance.
    pub ledger_liabilities: i128,
    pub pending_withdrawals: Amount,
    pub solvent: bool,
    /// Compensating entries written during this check.
    pub adjustments: Vec<TreasuryEntry>,
    /// Pending withdrawals whose transfer could not be found by reference.
    /// Settled with [`TreasuryLedger::resolve_stuck_withdrawal`].
    pub unresolved_withdrawals: Vec<TreasuryEntry>,
}

pub struct TreasuryLedger {
    store: Arc<dyn SettlementStore>,
    reader: Arc<dyn ChainReader>,
    wallet: Arc<dyn TreasuryWallet>,
    retry: RetryPolicy,
    metrics: Arc<WagerMetrics>,
    account_locks: Vec<Mutex<()>>,
    withdrawals: Mutex<()>,
}

impl TreasuryLedger {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        reader: Arc<dyn ChainReader>,
        wallet: Arc<dyn TreasuryWallet>,
        retry: RetryPolicy,
        metrics: Arc<WagerMetrics>,
    ) -> Self {
        Self {
            store,
            reader,
            wallet,
            retry,
            metrics,
            account_locks: (0..ACCOUNT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            withdrawals: Mutex::new(()),
        }
    }

    pub fn treasury_account(&self) -> Address {
        self.wallet.treasury_account()
    }

    /// Balance decisions for one account are serialized on its stripe.
    fn account_lock(&self, account: &Address) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        account.hash(&mut hasher);
        &self.account_locks[hasher.finish() as usize % self.account_locks.len()]
    }

    fn write(&self, entry: &TreasuryEntry) -> WagerResult<()> {
        self.store.insert_entry(entry)?;
        self.metrics.record_entry(entry.kind.label(), entry.status.label());
        Ok(())
    }

    fn settle(&self, entry: &mut TreasuryEntry, status: EntryStatus) -> WagerResult<()> {
        entry.status = status;
        entry.settled_at = Some(now_millis());
        self.store.update_entry(entry)?;
        self.metrics.record_entry(entry.kind.label(), status.label());
        Ok(())
    }

    /// Record an inbound transfer. Confirmed later from its receipt.
    /// Recording the same transaction twice returns the first entry; a
    /// transaction already claimed by another account is refused.
    pub fn record_deposit(&self, account: &Address, amount: Amount, tx_ref: TxRef) -> WagerResult<TreasuryEntry> {
        if amount == 0 {
            return Err(TreasuryError::InvalidAmount.into());
        }
        if let Some(existing) = self.store.list_entries()?.into_iter().find(|e| {
            e.kind == EntryKind::Deposit && e.status != EntryStatus::Failed && e.tx_ref.as_ref() == Some(&tx_ref)
        }) {
            if &existing.account != account {
                warn!(%account, %tx_ref, claimed_by = %existing.account, "Deposit transaction already claimed");
                return Err(TreasuryError::TransferClaimed { tx_ref: tx_ref.0 }.into());
            }
            return Ok(existing);
        }

        let entry = TreasuryEntry::new(EntryKind::Deposit, account.clone(), amount, EntryStatus::Pending).with_tx_ref(tx_ref);
        self.write(&entry)?;
        info!(entry_id = %entry.id, %account, amount, "Deposit recorded");
        Ok(entry)
    }

    /// Settle one pending external entry from its receipt. Entries whose
    /// receipt is not available yet stay pending. A withdrawal dispatched
    /// without a known transaction is first looked up by its reference.
    pub async fn confirm(&self, entry_id: &str) -> WagerResult<TreasuryEntry> {
        let mut entry = self
            .store
            .get_entry(entry_id)?
            .ok_or_else(|| TreasuryError::EntryNotFound(entry_id.to_string()))?;
        if entry.status != EntryStatus::Pending {
            return Ok(entry);
        }
        let tx_ref = match entry.tx_ref.clone() {
            Some(tx_ref) => tx_ref,
            None if entry.kind == EntryKind::Withdrawal => {
                let found = retry_transient(&self.retry, "transfer_by_reference", || async {
                    self.wallet.transfer_by_reference(&entry.id).await.into_result()
                })
                .await?;
                match found {
                    Some(tx_ref) => {
                        entry.tx_ref = Some(tx_ref.clone());
                        self.store.update_entry(&entry)?;
                        info!(entry_id, %tx_ref, "Withdrawal transfer found by reference");
                        tx_ref
                    }
                    None => return Ok(entry),
                }
            }
            None => return Ok(entry),
        };

        let receipt = retry_transient(&self.retry, "get_transaction_receipt", || async {
            self.reader.get_transaction_receipt(&tx_ref).await.into_result()
        })
        .await?;
        let receipt = match receipt {
            Some(receipt) => receipt,
            None => return Ok(entry),
        };
        match receipt.status {
            ReceiptStatus::Success => match self.transfer_mismatch(&entry, &receipt) {
                None => {
                    self.settle(&mut entry, EntryStatus::Confirmed)?;
                    info!(entry_id, kind = entry.kind.label(), %tx_ref, "Entry confirmed");
                }
                Some(reason) => {
                    self.settle(&mut entry, EntryStatus::Failed)?;
                    self.store.append_audit(&AuditRecord::new(
                        AuditSeverity::Warning,
                        format!("entry {}", entry.id),
                        format!("deposit of {} by {} rejected: {}", entry.amount, entry.account, reason),
                    ))?;
                    warn!(entry_id, account = %entry.account, %tx_ref, %reason, "Deposit does not match its transfer");
                }
            },
            ReceiptStatus::Reverted => {
                self.settle(&mut entry, EntryStatus::Failed)?;
                warn!(entry_id, kind = entry.kind.label(), %tx_ref, "Transfer reverted, entry failed");
            }
        }
        Ok(entry)
    }

    /// Why a successful receipt does not back `entry`, if it does not.
    fn transfer_mismatch(&self, entry: &TreasuryEntry, receipt: &Receipt) -> Option<String> {
        if entry.kind != EntryKind::Deposit {
            return None;
        }
        let treasury = self.wallet.treasury_account();
        if receipt.to.as_ref() != Some(&treasury) {
            return Some(format!("transaction {} does not pay the treasury", receipt.tx_ref));
        }
        if receipt.from != entry.account {
            return Some(format!("transaction {} was sent by {}", receipt.tx_ref, receipt.from));
        }
        if receipt.value < entry.amount {
            return Some(format!("transaction {} moved {}", receipt.tx_ref, receipt.value));
        }
        None
    }

    /// Run [`TreasuryLedger::confirm`] over every pending entry. Returns the
    /// entries that settled.
    pub async fn confirm_pending(&self) -> WagerResult<Vec<TreasuryEntry>> {
        let mut settled = Vec::new();
        for pending in self.store.pending_entries()? {
            match self.confirm(&pending.id).await {
                Ok(entry) if entry.status != EntryStatus::Pending => settled.push(entry),
                Ok(_) => {}
                Err(e) => warn!(entry_id = %pending.id, error = %e, "Confirmation deferred"),
            }
        }
        Ok(settled)
    }

    /// Signed sum of the account's confirmed entries.
    pub fn reconcile(&self, account: &Address) -> WagerResult<i128> {
        Ok(self
            .store
            .entries_for(account)?
            .iter()
            .filter(|e| e.status == EntryStatus::Confirmed)
            .map(TreasuryEntry::signed_amount)
            .sum())
    }

    /// Reconciled balance minus withdrawals still in flight.
    pub fn available_balance(&self, account: &Address) -> WagerResult<i128> {
        let entries = self.store.entries_for(account)?;
        let confirmed: i128 = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Confirmed)
            .map(TreasuryEntry::signed_amount)
            .sum();
        let in_flight: i128 = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending && !e.kind.is_credit())
            .map(|e| e.amount as i128)
            .sum();
        Ok(confirmed - in_flight)
    }

    /// Sum of withdrawals recorded but not settled, across all accounts.
    fn pending_withdrawals(&self) -> WagerResult<Amount> {
        Ok(self
            .store
            .pending_entries()?
            .iter()
            .filter(|e| e.kind == EntryKind::Withdrawal)
            .map(|e| e.amount)
            .sum())
    }

    /// Pay `amount` out of the treasury to `account`.
    ///
    /// Fails with `InsufficientTreasuryFunds` when the live treasury balance
    /// net of pending withdrawals is below `amount`, and with
    /// `InsufficientAccountBalance` when the account's available balance is.
    /// The returned entry is `Pending` unless the receipt was already
    /// readable.
    pub async fn withdraw(&self, account: &Address, amount: Amount) -> WagerResult<TreasuryEntry> {
        if amount == 0 {
            return Err(TreasuryError::InvalidAmount.into());
        }
        let _account_guard = self.account_lock(account).lock().await;
        let _treasury_guard = self.withdrawals.lock().await;

        let treasury = self.wallet.treasury_account();
        let live = retry_transient(&self.retry, "get_balance", || self.reader.get_balance(&treasury))
            .await
            .map_err(lift_chain_error)?;
        let in_flight = self.pending_withdrawals()?;
        let spendable = live.saturating_sub(in_flight);
        if spendable < amount {
            warn!(%account, amount, live, in_flight, "Withdrawal exceeds treasury balance");
            return Err(TreasuryError::InsufficientTreasuryFunds {
                requested: amount,
                available: spendable,
            }
            .into());
        }

        let available = self.available_balance(account)?;
        if available < amount as i128 {
            return Err(TreasuryError::InsufficientAccountBalance {
                account: account.clone(),
                requested: amount,
                available: available.max(0) as Amount,
            }
            .into());
        }

        let mut entry = TreasuryEntry::new(EntryKind::Withdrawal, account.clone(), amount, EntryStatus::Pending);
        self.write(&entry)?;

        // Never retried here; the confirmation loop finds the transfer by reference.
        match with_timeout(&self.retry, self.wallet.transfer(account, amount, &entry.id)).await {
            Ok(tx_ref) => {
                entry.tx_ref = Some(tx_ref.clone());
                self.store.update_entry(&entry)?;
                info!(entry_id = %entry.id, %account, amount, %tx_ref, "Withdrawal dispatched");
            }
            Err(e) if e.is_transient() => {
                warn!(entry_id = %entry.id, %account, amount, error = %e, "Withdrawal outcome unknown, left pending");
                self.store.append_audit(&AuditRecord::new(
                    AuditSeverity::Warning,
                    format!("entry {}", entry.id),
                    format!("transfer of {} to {} has no transaction yet: {}", amount, account, e),
                ))?;
                return Ok(entry);
            }
            Err(e) => {
                self.settle(&mut entry, EntryStatus::Failed)?;
                return Err(lift_chain_error(e));
            }
        }

        self.confirm(&entry.id).await
    }

    fn internal(
        &self,
        kind: EntryKind,
        account: &Address,
        amount: Amount,
        reference: &RequestId,
    ) -> WagerResult<TreasuryEntry> {
        if let Some(existing) = self.store.entry_for_reference(reference, kind)? {
            return Ok(existing);
        }
        let mut entry = TreasuryEntry::new(kind, account.clone(), amount, EntryStatus::Confirmed)
            .with_reference(reference.clone());
        entry.settled_at = Some(entry.timestamp);
        self.write(&entry)?;
        info!(entry_id = %entry.id, kind = kind.label(), %account, amount, request_id = %reference, "Ledger movement");
        Ok(entry)
    }

    /// Debit a game stake. One stake per request.
    pub async fn record_stake(&self, account: &Address, amount: Amount, reference: &RequestId) -> WagerResult<TreasuryEntry> {
        if amount == 0 {
            return Err(TreasuryError::InvalidAmount.into());
        }
        let _guard = self.account_lock(account).lock().await;

        if let Some(existing) = self.store.entry_for_reference(reference, EntryKind::Stake)? {
            return Ok(existing);
        }
        let available = self.available_balance(account)?;
        if available < amount as i128 {
            return Err(TreasuryError::InsufficientAccountBalance {
                account: account.clone(),
                requested: amount,
                available: available.max(0) as Amount,
            }
            .into());
        }
        self.internal(EntryKind::Stake, account, amount, reference)
    }

    /// Credit a game payout. One payout per request.
    pub fn record_payout(&self, account: &Address, amount: Amount, reference: &RequestId) -> WagerResult<TreasuryEntry> {
        self.internal(EntryKind::Payout, account, amount, reference)
    }

    /// Credit back the stake of an expired or rejected request. One refund
    /// per request.
    pub fn record_refund(&self, account: &Address, amount: Amount, reference: &RequestId) -> WagerResult<TreasuryEntry> {
        self.internal(EntryKind::Refund, account, amount, reference)
    }

    pub fn entries(&self, account: &Address) -> WagerResult<Vec<TreasuryEntry>> {
        Ok(self.store.entries_for(account)?)
    }

    /// Settle a withdrawal whose transfer cannot be found by reference,
    /// after an operator has checked the chain by hand.
    pub fn resolve_stuck_withdrawal(&self, entry_id: &str, landed: bool) -> WagerResult<TreasuryEntry> {
        let mut entry = self
            .store
            .get_entry(entry_id)?
            .ok_or_else(|| TreasuryError::EntryNotFound(entry_id.to_string()))?;
        let refuse = |reason: &str| -> WagerResult<TreasuryEntry> {
            Err(TreasuryError::NotResolvable {
                id: entry_id.to_string(),
                reason: reason.to_string(),
            }
            .into())
        };
        if entry.kind != EntryKind::Withdrawal {
            return refuse("not a withdrawal");
        }
        if entry.status != EntryStatus::Pending {
            return refuse("already settled");
        }
        if entry.tx_ref.is_some() {
            return refuse("its transaction is known; the receipt settles it");
        }

        let status = if landed { EntryStatus::Confirmed } else { EntryStatus::Failed };
        self.settle(&mut entry, status)?;
        self.store.append_audit(&AuditRecord::new(
            AuditSeverity::Warning,
            format!("entry {}", entry.id),
            format!("withdrawal of {} to {} settled {} by an operator", entry.amount, entry.account, status.label()),
        ))?;
        warn!(entry_id, status = status.label(), "Stuck withdrawal resolved by operator");
        Ok(entry)
    }

    /// Every entry of `account` next to its receipt status.
    pub async fn reconciliation_view(&self, account: &Address) -> WagerResult<Vec<ReconciledEntry>> {
        let mut view = Vec::new();
        for entry in self.store.entries_for(account)? {
            let receipt = self.receipt_for(&entry).await;
            let chain_status = receipt.as_ref().map(|r| r.status);
            let mismatch = match (entry.status, &receipt) {
                (EntryStatus::Confirmed, Some(r)) => r.status == ReceiptStatus::Reverted,
                (EntryStatus::Failed, Some(r)) => {
                    r.status == ReceiptStatus::Success && self.transfer_mismatch(&entry, r).is_none()
                }
                _ => false,
            };
            view.push(ReconciledEntry {
                entry,
                chain_status,
                mismatch,
            });
        }
        Ok(view)
    }

    async fn receipt_for(&self, entry: &TreasuryEntry) -> Option<Receipt> {
        let tx_ref = entry.tx_ref.as_ref()?;
        if !entry.kind.is_external() {
            return None;
        }
        match self.reader.get_transaction_receipt(tx_ref).await.into_result() {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Receipt unavailable for reconciliation");
                None
            }
        }
    }

    /// Compare the ledger with the live treasury balance and compensate
    /// confirmed transfers whose receipt now reports failure.
    pub async fn treasury_health(&self) -> WagerResult<TreasuryHealth> {
        let treasury = self.wallet.treasury_account();
        let entries = self.store.list_entries()?;
        let mut adjustments = Vec::new();

        for entry in entries.iter().filter(|e| e.status == EntryStatus::Confirmed && e.kind.is_external()) {
            if self.receipt_for(entry).await.map(|r| r.status) != Some(ReceiptStatus::Reverted) {
                continue;
            }
            let marker = format!("compensates {}", entry.id);
            if entries.iter().any(|e| e.note.as_deref() == Some(marker.as_str())) {
                continue;
            }
            let kind = if entry.kind.is_credit() {
                EntryKind::AdjustmentDebit
            } else {
                EntryKind::AdjustmentCredit
            };
            let mut adjustment = TreasuryEntry::new(kind, entry.account.clone(), entry.amount, EntryStatus::Confirmed)
                .with_note(marker);
            adjustment.settled_at = Some(adjustment.timestamp);
            self.write(&adjustment)?;
            self.store.append_audit(&AuditRecord::new(
                AuditSeverity::Critical,
                format!("entry {}", entry.id),
                format!(
                    "confirmed {} of {} reverted on chain; compensated by {}",
                    entry.kind.label(),
                    entry.amount,
                    adjustment.id
                ),
            ))?;
            error!(entry_id = %entry.id, adjustment_id = %adjustment.id, "Ledger inconsistency compensated");
            adjustments.push(adjustment);
        }

        let entries = self.store.list_entries()?;
        let ledger_liabilities: i128 = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Confirmed)
            .map(TreasuryEntry::signed_amount)
            .sum();
        let pending_withdrawals: Amount = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending && e.kind == EntryKind::Withdrawal)
            .map(|e| e.amount)
            .sum();
        let unresolved_withdrawals: Vec<TreasuryEntry> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending && e.kind == EntryKind::Withdrawal && e.tx_ref.is_none())
            .cloned()
            .collect();
        let on_chain_balance = retry_transient(&self.retry, "get_balance", || self.reader.get_balance(&treasury))
            .await
            .map_err(lift_chain_error)?;

        let solvent = ledger_liabilities - pending_withdrawals as i128 <= on_chain_balance as i128;
        if !solvent {
            warn!(ledger_liabilities, on_chain_balance, "Ledger liabilities exceed treasury balance");
        }
        Ok(TreasuryHealth {
            treasury,
            on_chain_balance,
            ledger_liabilities,
            pending_withdrawals,
            solvent,
            adjustments,
            unresolved_withdrawals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{InMemoryChain, TREASURY_ADDRESS};
    use crate::errors::WagerError;
    use crate::store::MemoryStore;

    fn player() -> Address {
        Address::new("0x00000000000000000000000000000000000000d1")
    }

    fn ledger() -> (Arc<InMemoryChain>, Arc<MemoryStore>, TreasuryLedger) {
        let chain = Arc::new(InMemoryChain::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = TreasuryLedger::new(
            store.clone(),
            chain.clone(),
            chain.clone(),
            RetryPolicy::immediate(3),
            Arc::new(WagerMetrics::new().unwrap()),
        );
        (chain, store, ledger)
    }

    async fn funded(chain: &InMemoryChain, ledger: &TreasuryLedger, amount: Amount) {
        let tx_ref = chain.external_transfer(&player(), amount);
        let entry = ledger.record_deposit(&player(), amount, tx_ref).unwrap();
        assert_eq!(ledger.confirm(&entry.id).await.unwrap().status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_deposit_is_pending_until_confirmed() {
        let (chain, _, ledger) = ledger();
        let tx_ref = chain.external_transfer(&player(), 40);
        let entry = ledger.record_deposit(&player(), 40, tx_ref.clone()).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(ledger.reconcile(&player()).unwrap(), 0);

        let again = ledger.record_deposit(&player(), 40, tx_ref).unwrap();
        assert_eq!(again.id, entry.id);

        ledger.confirm_pending().await.unwrap();
        assert_eq!(ledger.reconcile(&player()).unwrap(), 40);
    }

    #[tokio::test]
    async fn test_withdraw_rereads_live_balance() {
        let (chain, store, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        // Funds leave the treasury behind the ledger's back.
        chain.set_balance(&Address::new(TREASURY_ADDRESS), 5);

        let err = ledger.withdraw(&player(), 10).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::Treasury(TreasuryError::InsufficientTreasuryFunds { requested: 10, available: 5 })
        ));
        assert!(store
            .list_entries()
            .unwrap()
            .iter()
            .all(|e| e.kind != EntryKind::Withdrawal));
    }

    #[tokio::test]
    async fn test_withdraw_never_overdraws_account() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;

        let err = ledger.withdraw(&player(), 11).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::Treasury(TreasuryError::InsufficientAccountBalance { requested: 11, .. })
        ));

        let entry = ledger.withdraw(&player(), 7).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
        assert_eq!(ledger.reconcile(&player()).unwrap(), 3);
        assert_eq!(chain.balance_of(&player()), 7);
    }

    #[tokio::test]
    async fn test_pending_withdrawal_holds_funds() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        chain.withhold_receipts(true);

        let first = ledger.withdraw(&player(), 6).await.unwrap();
        assert_eq!(first.status, EntryStatus::Pending);
        assert!(ledger.withdraw(&player(), 6).await.is_err());

        chain.release_receipts();
        let settled = ledger.confirm_pending().await.unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(ledger.reconcile(&player()).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reverted_transfer_fails_entry() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        chain.revert_transfers(true);

        let entry = ledger.withdraw(&player(), 4).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(ledger.reconcile(&player()).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_internal_movements_are_idempotent() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        let reference = RequestId::from_digest(&[5u8; 32]);

        ledger.record_stake(&player(), 4, &reference).await.unwrap();
        ledger.record_stake(&player(), 4, &reference).await.unwrap();
        ledger.record_payout(&player(), 8, &reference).unwrap();
        ledger.record_payout(&player(), 8, &reference).unwrap();
        assert_eq!(ledger.reconcile(&player()).unwrap(), 14);

        let other = RequestId::from_digest(&[6u8; 32]);
        assert!(ledger.record_stake(&player(), 15, &other).await.is_err());
    }

    #[tokio::test]
    async fn test_health_compensates_reverted_confirmed_withdrawal() {
        let (chain, store, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        let entry = ledger.withdraw(&player(), 4).await.unwrap();
        let tx_ref = entry.tx_ref.clone().unwrap();
        chain.rewrite_receipt_status(&tx_ref, ReceiptStatus::Reverted);

        let view = ledger.reconciliation_view(&player()).await.unwrap();
        assert!(view.iter().any(|r| r.mismatch));

        let health = ledger.treasury_health().await.unwrap();
        assert_eq!(health.adjustments.len(), 1);
        assert_eq!(health.adjustments[0].kind, EntryKind::AdjustmentCredit);
        assert_eq!(ledger.reconcile(&player()).unwrap(), 10);
        assert_eq!(store.audit_records().unwrap().len(), 1);

        // Compensation is written once.
        assert!(ledger.treasury_health().await.unwrap().adjustments.is_empty());
    }

    fn other() -> Address {
        Address::new("0x00000000000000000000000000000000000000d2")
    }

    #[tokio::test]
    async fn test_deposit_must_match_its_transfer() {
        let (chain, store, ledger) = ledger();

        // A transaction that pays nobody.
        let fulfillment_tx = chain.fulfill(1, [1u8; 32], [2u8; 32]).tx_ref.unwrap();
        let entry = ledger.record_deposit(&player(), 50, fulfillment_tx).unwrap();
        assert_eq!(ledger.confirm(&entry.id).await.unwrap().status, EntryStatus::Failed);

        // Someone else's transfer.
        let foreign = chain.external_transfer(&other(), 30);
        let entry = ledger.record_deposit(&player(), 30, foreign.clone()).unwrap();
        assert_eq!(ledger.confirm(&entry.id).await.unwrap().status, EntryStatus::Failed);

        // More than was sent.
        let small = chain.external_transfer(&player(), 5);
        let entry = ledger.record_deposit(&player(), 500, small).unwrap();
        assert_eq!(ledger.confirm(&entry.id).await.unwrap().status, EntryStatus::Failed);

        assert_eq!(ledger.reconcile(&player()).unwrap(), 0);
        assert_eq!(store.audit_records().unwrap().len(), 3);
        let err = ledger.withdraw(&player(), 5).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::Treasury(TreasuryError::InsufficientAccountBalance { requested: 5, .. })
        ));
        let view = ledger.reconciliation_view(&player()).await.unwrap();
        assert!(view.iter().all(|r| !r.mismatch));

        // The real sender can still claim the transfer that was cited against it.
        let entry = ledger.record_deposit(&other(), 30, foreign).unwrap();
        assert_eq!(ledger.confirm(&entry.id).await.unwrap().status, EntryStatus::Confirmed);
        assert_eq!(ledger.reconcile(&other()).unwrap(), 30);
    }

    #[tokio::test]
    async fn test_claimed_transfer_is_refused_to_another_account() {
        let (chain, _, ledger) = ledger();
        chain.withhold_receipts(true);
        let tx_ref = chain.external_transfer(&other(), 20);
        ledger.record_deposit(&other(), 20, tx_ref.clone()).unwrap();

        let err = ledger.record_deposit(&player(), 20, tx_ref).unwrap_err();
        assert!(matches!(err, WagerError::Treasury(TreasuryError::TransferClaimed { .. })));
    }

    #[tokio::test]
    async fn test_withdrawals_reserve_treasury_funds_across_accounts() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        let tx_ref = chain.external_transfer(&other(), 10);
        let entry = ledger.record_deposit(&other(), 10, tx_ref).unwrap();
        ledger.confirm(&entry.id).await.unwrap();
        chain.set_balance(&Address::new(TREASURY_ADDRESS), 10);
        chain.withhold_receipts(true);

        let first = ledger.withdraw(&player(), 8).await.unwrap();
        assert_eq!(first.status, EntryStatus::Pending);
        let err = ledger.withdraw(&other(), 8).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::Treasury(TreasuryError::InsufficientTreasuryFunds { requested: 8, available: 2 })
        ));

        chain.withhold_receipts(false);
        chain.release_receipts();
        assert_eq!(ledger.confirm_pending().await.unwrap().len(), 1);
        assert_eq!(ledger.withdraw(&other(), 2).await.unwrap().status, EntryStatus::Confirmed);
        assert_eq!(chain.balance_of(&Address::new(TREASURY_ADDRESS)), 0);
    }

    #[tokio::test]
    async fn test_concurrent_withdrawals_never_overdraw_treasury() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        let tx_ref = chain.external_transfer(&other(), 10);
        let entry = ledger.record_deposit(&other(), 10, tx_ref).unwrap();
        ledger.confirm(&entry.id).await.unwrap();
        chain.set_balance(&Address::new(TREASURY_ADDRESS), 10);

        let (player, other) = (player(), other());
        let (a, b) = tokio::join!(ledger.withdraw(&player, 8), ledger.withdraw(&other, 8));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(chain.balance_of(&Address::new(TREASURY_ADDRESS)), 2);
        assert_eq!(chain.calls("transfer"), 1);
    }

    #[tokio::test]
    async fn test_lost_transfer_response_is_found_by_reference() {
        let (chain, _, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        chain.lose_transfer_responses(1);

        let entry = ledger.withdraw(&player(), 4).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.tx_ref.is_none());
        assert_eq!(ledger.treasury_health().await.unwrap().unresolved_withdrawals.len(), 1);

        let settled = ledger.confirm_pending().await.unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].status, EntryStatus::Confirmed);
        assert!(settled[0].tx_ref.is_some());
        assert_eq!(ledger.reconcile(&player()).unwrap(), 6);
        assert_eq!(chain.balance_of(&player()), 4);
        assert_eq!(chain.calls("transfer"), 1);
        assert!(ledger.treasury_health().await.unwrap().unresolved_withdrawals.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_withdrawal_is_settled_by_operator() {
        let (chain, store, ledger) = ledger();
        funded(&chain, &ledger, 10).await;
        chain.fail_next("transfer", 1);

        let entry = ledger.withdraw(&player(), 4).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(ledger.confirm_pending().await.unwrap().is_empty());
        let health = ledger.treasury_health().await.unwrap();
        assert_eq!(health.unresolved_withdrawals.len(), 1);
        assert_eq!(health.unresolved_withdrawals[0].id, entry.id);
        assert_eq!(ledger.available_balance(&player()).unwrap(), 6);

        let resolved = ledger.resolve_stuck_withdrawal(&entry.id, false).unwrap();
        assert_eq!(resolved.status, EntryStatus::Failed);
        assert_eq!(ledger.available_balance(&player()).unwrap(), 10);
        assert_eq!(store.audit_records().unwrap().len(), 2);

        assert!(matches!(
            ledger.resolve_stuck_withdrawal(&entry.id, true),
            Err(WagerError::Treasury(TreasuryError::NotResolvable { .. }))
        ));
        let deposit = ledger.entries(&player()).unwrap().into_iter().find(|e| e.kind == EntryKind::Deposit).unwrap();
        assert!(ledger.resolve_stuck_withdrawal(&deposit.id, true).is_err());
    }
}
