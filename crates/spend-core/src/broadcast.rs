//! Publishing signed spends and reconciling the ledger afterwards.

use std::collections::BTreeSet;

use bitcoin::{OutPoint, Transaction, Txid};
use chain_btc::address::script_to_address;
use chain_btc::network::BtcNetwork;
use chain_btc::psbt::{decode_psbt, finalize, parse_raw_transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{BroadcastRequest, BroadcastResponse};
use crate::collaborators::ChainError;
use crate::error::{Result, SpendError};
use crate::ledger::StoreError;
use crate::types::{Draft, DraftStatus, TransactionRecord, TxType, UtxoRecord};
use crate::SpendService;

/// How a broadcast transaction moves the wallet's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Classification {
    tx_type: TxType,
    amount_sat: i64,
    fee_sat: u64,
    counterparty: Option<String>,
}

impl SpendService {
    /// Finalize and publish a spend, then record it.
    ///
    /// The ledger is only touched once the network accepted the
    /// transaction: a rejection leaves every coin, lock and draft as it was.
    pub fn broadcast(&self, wallet_id: Uuid, req: &BroadcastRequest) -> Result<BroadcastResponse> {
        let wallet = self.wallet_context(wallet_id)?;
        let draft = match req.draft_id {
            Some(draft_id) => Some(self.signed_draft(wallet_id, draft_id)?),
            None => None,
        };
        let tx = transaction_to_send(req, draft.as_ref())?;
        let txid = tx.compute_txid();

        let spent: Vec<OutPoint> = tx.input.iter().map(|i| i.previous_output).collect();
        if let Some(draft) = &draft {
            let expected: BTreeSet<OutPoint> = draft.utxo_ids.iter().copied().collect();
            let actual: BTreeSet<OutPoint> = spent.iter().copied().collect();
            if expected != actual {
                return Err(SpendError::InvalidRequest(format!(
                    "transaction {txid} does not spend the coins of draft {}",
                    draft.id
                )));
            }
        }

        let owned: Vec<UtxoRecord> = self
            .ledger
            .get_utxos(&spent)?
            .into_iter()
            .filter(|r| r.wallet_id == wallet_id)
            .collect();
        let classification = self.classify(wallet_id, wallet.info.network, &tx, &owned, req)?;

        let accepted = self.chain.broadcast(&tx).map_err(|e| {
            warn!(%wallet_id, %txid, error = %e, "broadcast failed");
            match e {
                ChainError::Rejected(msg) => SpendError::BroadcastRejected(msg),
                ChainError::Unavailable(msg) => SpendError::ChainUnavailable(msg),
            }
        })?;
        if accepted != txid {
            warn!(%txid, node_txid = %accepted, "node reported a different txid");
        }

        let record = TransactionRecord {
            txid,
            wallet_id,
            tx_type: classification.tx_type,
            amount_sat: classification.amount_sat,
            fee_sat: classification.fee_sat,
            balance_after_sat: 0,
            confirmations: 0,
            counterparty_address: classification.counterparty,
            memo: req.memo.clone().filter(|m| !m.trim().is_empty()),
            rbf_signaled: tx.is_explicitly_rbf(),
            replaces_txid: req.replaces_txid,
            replaced_by_txid: None,
            created_at: self.clock.now(),
        };
        let owned_ids: Vec<OutPoint> = owned.iter().map(|r| r.outpoint()).collect();
        self.reconcile(wallet_id, txid, &owned_ids, record, req.replaces_txid, draft.as_ref());

        info!(
            %wallet_id,
            %txid,
            tx_type = ?classification.tx_type,
            amount_sat = classification.amount_sat,
            fee_sat = classification.fee_sat,
            "transaction broadcast"
        );
        Ok(BroadcastResponse {
            txid,
            broadcasted: true,
        })
    }

    fn signed_draft(&self, wallet_id: Uuid, draft_id: Uuid) -> Result<Draft> {
        let draft = self.live_draft(draft_id, self.clock.now())?;
        if draft.wallet_id != wallet_id {
            return Err(SpendError::DraftNotFound(draft_id));
        }
        if draft.status != DraftStatus::Signed {
            return Err(SpendError::DraftNotSigned(draft_id));
        }
        Ok(draft)
    }

    fn classify(
        &self,
        wallet_id: Uuid,
        network: BtcNetwork,
        tx: &Transaction,
        owned: &[UtxoRecord],
        req: &BroadcastRequest,
    ) -> Result<Classification> {
        if owned.len() != tx.input.len() {
            // Some inputs belong to someone else, as in a payjoin; trust the caller's figures.
            return Ok(Classification {
                tx_type: TxType::Sent,
                amount_sat: -to_signed(req.amount.saturating_add(req.fee)),
                fee_sat: req.fee,
                counterparty: Some(req.recipient.clone()),
            });
        }

        let total_input: u64 = owned.iter().map(|r| r.amount_sat()).sum();
        let total_output: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee_sat = total_input.checked_sub(total_output).ok_or_else(|| {
            SpendError::MalformedTransaction(format!(
                "outputs ({total_output} sat) exceed inputs ({total_input} sat)"
            ))
        })?;

        let mut external_sat = 0u64;
        let mut counterparty = None;
        for output in &tx.output {
            if self
                .registry
                .derivation_of(wallet_id, &output.script_pubkey)?
                .is_some()
            {
                continue;
            }
            external_sat += output.value.to_sat();
            if counterparty.is_none() {
                counterparty = script_to_address(&output.script_pubkey, network);
            }
        }

        Ok(if external_sat == 0 {
            Classification {
                tx_type: TxType::Consolidation,
                amount_sat: -to_signed(fee_sat),
                fee_sat,
                counterparty: None,
            }
        } else {
            Classification {
                tx_type: TxType::Sent,
                amount_sat: -to_signed(external_sat + fee_sat),
                fee_sat,
                counterparty,
            }
        })
    }

    /// Ledger bookkeeping after the network accepted `txid`. Failures here
    /// are logged, not returned: the transaction is already out.
    fn reconcile(
        &self,
        wallet_id: Uuid,
        txid: Txid,
        spent: &[OutPoint],
        record: TransactionRecord,
        replaces: Option<Txid>,
        draft: Option<&Draft>,
    ) {
        if let Err(e) = self.ledger.mark_spent(spent, record) {
            error!(%wallet_id, %txid, error = %e, "failed to record broadcast transaction");
        }

        if let Some(original) = replaces {
            match self.ledger.mark_replaced(&original, &txid) {
                Ok(()) => info!(%original, replacement = %txid, "replacement recorded"),
                Err(StoreError::NotFound(_)) => {
                    warn!(%original, replacement = %txid, "replaced transaction is not in the ledger")
                }
                Err(e) => error!(%original, error = %e, "failed to record replacement"),
            }
        }

        if let Err(e) = self.ledger.recalculate_balances(wallet_id) {
            error!(%wallet_id, error = %e, "failed to recalculate balances");
        }

        if let Some(draft) = draft {
            if let Err(e) = self.ledger.delete_draft(draft.id) {
                error!(draft_id = %draft.id, error = %e, "failed to remove broadcast draft");
            }
        }
    }
}

/// The transaction a request asks to publish.
fn transaction_to_send(req: &BroadcastRequest, draft: Option<&Draft>) -> Result<Transaction> {
    let tx = match (&req.signed_psbt_base64, &req.raw_tx_hex) {
        (Some(_), Some(_)) => {
            return Err(SpendError::InvalidRequest(
                "give either signedPsbtBase64 or rawTxHex, not both".into(),
            ))
        }
        (Some(psbt), None) => finalize(&decode_psbt(psbt)?)?,
        (None, Some(raw)) => parse_raw_transaction(raw)?,
        (None, None) => match draft {
            Some(draft) => finalize(&decode_psbt(draft.latest_psbt())?)?,
            None => {
                return Err(SpendError::InvalidRequest(
                    "nothing to broadcast: no transaction or draft given".into(),
                ))
            }
        },
    };
    if tx.input.is_empty() || tx.output.is_empty() {
        return Err(SpendError::MalformedTransaction(
            "transaction needs at least one input and one output".into(),
        ));
    }
    Ok(tx)
}

fn to_signed(sat: u64) -> i64 {
    i64::try_from(sat).unwrap_or(i64::MAX)
}
