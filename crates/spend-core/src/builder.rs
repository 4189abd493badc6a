//! Turning a spend request into an unsigned PSBT.

use std::collections::HashSet;

use bitcoin::absolute::LockTime;
use bitcoin::{Address, OutPoint, Script, Transaction, Txid};
use chain_btc::address::parse_address;
use chain_btc::error::BtcError;
use chain_btc::fee::FeeRate;
use chain_btc::network::BtcNetwork;
use chain_btc::psbt::{encode_psbt, input_key_origins, summarize};
use chain_btc::transaction::{
    build_psbt, plan_transaction, Payment, PlanRequest, PsbtInput, PsbtOutput, Recipient,
};
use chain_btc::utxo::{select_all, select_utxos, Keychain, Utxo};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{CreateSpendRequest, CreateSpendResponse, DecoyOutput, FeeRecommendation, InputPath};
use crate::error::{Result, SpendError};
use crate::selector::{CoinPool, Ineligibility};
use crate::types::{DraftOutput, UtxoRecord};
use crate::{SpendService, WalletContext};

/// Everything a draft needs from a built spend.
pub(crate) struct BuiltSpend {
    pub response: CreateSpendResponse,
    pub utxo_ids: Vec<OutPoint>,
    pub outputs: Vec<DraftOutput>,
    pub amount: u64,
    pub required_signatures: usize,
}

struct ResolvedOutput {
    address: Address,
    payment: Payment,
}

impl SpendService {
    /// Build an unsigned PSBT for a spend. Nothing is locked or stored.
    pub fn create_spend(&self, wallet_id: Uuid, req: &CreateSpendRequest) -> Result<CreateSpendResponse> {
        let built = self
            .build_spend(wallet_id, req)
            .inspect_err(|e| warn!(%wallet_id, error = %e, "spend rejected"))?;
        info!(
            %wallet_id,
            inputs = built.utxo_ids.len(),
            fee_sat = built.response.fee,
            change_sat = built.response.change_amount,
            "spend built"
        );
        Ok(built.response)
    }

    /// Fee rate for confirmation within `target_blocks`, kept inside the configured bounds.
    pub fn recommended_fee_rate(&self, target_blocks: u16) -> Result<FeeRecommendation> {
        let estimate = self
            .chain
            .fee_estimate(target_blocks)
            .map_err(|e| SpendError::ChainUnavailable(e.to_string()))?;
        let fee_rate = estimate
            .max(self.config.min_fee_rate())
            .min(self.config.max_fee_rate());
        Ok(FeeRecommendation {
            target_blocks,
            fee_rate,
        })
    }

    pub(crate) fn check_fee_rate(&self, rate: FeeRate) -> Result<()> {
        if rate < self.config.min_fee_rate() {
            return Err(SpendError::FeeTooLow {
                fee_rate: rate.as_sat_per_vb(),
                minimum: self.config.min_fee_rate,
            });
        }
        if rate > self.config.max_fee_rate() {
            return Err(SpendError::FeeTooHigh {
                fee_rate: rate.as_sat_per_vb(),
                maximum: self.config.max_fee_rate,
            });
        }
        Ok(())
    }

    pub(crate) fn build_spend(&self, wallet_id: Uuid, req: &CreateSpendRequest) -> Result<BuiltSpend> {
        let wallet = self.wallet_context(wallet_id)?;
        let network = wallet.info.network;
        let wallet_script = wallet.descriptor.wallet_script();

        self.check_fee_rate(req.fee_rate)?;
        let resolved = resolve_outputs(req, network)?;
        let decoys = req.decoy_outputs.unwrap_or(0);
        if decoys > self.config.max_decoy_outputs {
            return Err(SpendError::InvalidRequest(format!(
                "at most {} decoy outputs are allowed",
                self.config.max_decoy_outputs
            )));
        }
        if decoys > 0 && req.send_max {
            return Err(SpendError::InvalidRequest(
                "decoy outputs are carved from change and cannot be combined with sendMax".into(),
            ));
        }
        let change_override = req
            .change_address
            .as_deref()
            .map(|a| parse_address(a, network))
            .transpose()?;

        let recipients: Vec<Recipient> = resolved
            .iter()
            .map(|o| Recipient {
                script_pubkey: o.address.script_pubkey(),
                payment: o.payment,
            })
            .collect();
        let send_max = recipients.iter().any(|r| r.payment == Payment::SendMax);
        let fixed_total: u64 = recipients
            .iter()
            .filter_map(|r| match r.payment {
                Payment::Fixed(v) => Some(v),
                Payment::SendMax => None,
            })
            .sum();

        let recipient_list: &[Recipient] = &recipients;
        let plan_request = |num_inputs: usize, total_input_sat: u64| PlanRequest {
            wallet_script,
            num_inputs,
            total_input_sat,
            recipients: recipient_list,
            change_script_len: change_override
                .as_ref()
                .map(|a| a.script_pubkey().len())
                .unwrap_or(wallet_script.output_script_len()),
            decoy_outputs: decoys,
            fee_rate: req.fee_rate,
            dust_threshold_sat: wallet.dust_threshold_sat,
            subtract_fee_from_amount: req.subtract_fees,
        };
        let probe = plan_request(0, 0);

        let now = self.clock.now();
        let records = self.ledger.list_utxos(wallet_id)?;
        let pool = CoinPool::build(
            records.clone(),
            wallet.info.confirmation_threshold,
            None,
            now,
        );
        let explicit = explicit_coins(&records, &pool, req.selected_utxo_ids.as_deref())?;
        let explicit_ids: HashSet<OutPoint> = explicit.iter().map(|u| u.outpoint).collect();
        let candidates: Vec<Utxo> = pool
            .eligible
            .iter()
            .filter(|r| !explicit_ids.contains(&r.outpoint()))
            .map(|r| r.utxo.clone())
            .collect();

        let selection = if send_max {
            let coins = if explicit.is_empty() { candidates } else { explicit };
            select_all(coins, |n| probe.fee_with(n, 0))
        } else if req.subtract_fees {
            select_utxos(explicit, candidates, fixed_total, |_| 0, self.strategy.as_ref())
        } else {
            select_utxos(
                explicit,
                candidates,
                fixed_total,
                |n| probe.fee_with(n, 0),
                self.strategy.as_ref(),
            )
        }
        .map_err(|e| with_coin_counts(e, &pool))?;
        debug!(
            %wallet_id,
            strategy = self.strategy.name(),
            inputs = selection.selected.len(),
            total_sat = selection.total_sat,
            "coins selected"
        );

        let plan = plan_transaction(
            &plan_request(selection.selected.len(), selection.total_sat),
            &mut rand::thread_rng(),
        )
        .map_err(|e| with_coin_counts(e, &pool))?;

        let mut outputs = Vec::with_capacity(recipients.len() + 1 + plan.decoy_values.len());
        for (recipient, value) in recipients.iter().zip(&plan.recipient_values) {
            outputs.push(PsbtOutput {
                script_pubkey: recipient.script_pubkey.clone(),
                value_sat: *value,
                derivation: self.registry.derivation_of(wallet_id, &recipient.script_pubkey)?,
            });
        }

        let mut change_address = None;
        if let Some(value_sat) = plan.change_sat {
            let (address, derivation) = self.change_destination(&wallet, change_override.as_ref())?;
            outputs.push(PsbtOutput {
                script_pubkey: address.script_pubkey(),
                value_sat,
                derivation,
            });
            change_address = Some(address.to_string());
        }

        let mut decoy_outputs = Vec::with_capacity(plan.decoy_values.len());
        for value_sat in &plan.decoy_values {
            let index = self.registry.next_change_index(wallet_id)?;
            let address = wallet.descriptor.address(Keychain::Internal, index, network)?;
            outputs.push(PsbtOutput {
                script_pubkey: address.script_pubkey(),
                value_sat: *value_sat,
                derivation: Some((Keychain::Internal, index)),
            });
            decoy_outputs.push(DecoyOutput {
                address: address.to_string(),
                amount: *value_sat,
            });
        }
        if !decoy_outputs.is_empty() {
            outputs.shuffle(&mut rand::thread_rng());
        }

        let mut inputs = Vec::with_capacity(selection.selected.len());
        for utxo in selection.selected {
            let prev_tx = if wallet_script.is_segwit() {
                None
            } else {
                Some(self.previous_transaction(&utxo.outpoint.txid)?)
            };
            inputs.push(PsbtInput { utxo, prev_tx });
        }

        let psbt = build_psbt(
            &wallet.descriptor,
            &inputs,
            &outputs,
            req.enable_rbf,
            self.current_lock_time(),
        )?;

        let summary = summarize(&psbt)?;
        if summary.fee != plan.fee_sat || summary.total_input != plan.total_input_sat {
            return Err(SpendError::Build(format!(
                "psbt totals disagree with plan: fee {} vs {}",
                summary.fee, plan.fee_sat
            )));
        }

        let input_paths = inputs
            .iter()
            .zip(input_key_origins(&psbt))
            .map(|(input, key_origins)| InputPath {
                outpoint: input.utxo.outpoint,
                key_origins,
            })
            .collect();

        let draft_outputs: Vec<DraftOutput> = resolved
            .iter()
            .zip(&plan.recipient_values)
            .map(|(o, value)| DraftOutput {
                address: o.address.to_string(),
                amount: *value,
            })
            .collect();

        Ok(BuiltSpend {
            utxo_ids: inputs.iter().map(|i| i.utxo.outpoint).collect(),
            amount: plan.recipient_values.iter().sum(),
            outputs: draft_outputs,
            required_signatures: wallet.descriptor.required_signatures(),
            response: CreateSpendResponse {
                psbt_base64: encode_psbt(&psbt),
                fee: plan.fee_sat,
                total_input: plan.total_input_sat,
                total_output: plan.total_output_sat,
                change_amount: plan.change_sat.unwrap_or(0),
                change_address,
                input_paths,
                decoy_outputs: (decoys > 0).then_some(decoy_outputs),
            },
        })
    }

    /// Where change goes: the caller's override, or the wallet's next change address.
    fn change_destination(
        &self,
        wallet: &WalletContext,
        change_override: Option<&Address>,
    ) -> Result<(Address, Option<(Keychain, u32)>)> {
        if let Some(address) = change_override {
            let derivation = self.owned_derivation(wallet.info.id, &address.script_pubkey())?;
            return Ok((address.clone(), derivation));
        }
        let index = self.registry.next_change_index(wallet.info.id)?;
        let address = wallet
            .descriptor
            .address(Keychain::Internal, index, wallet.info.network)?;
        Ok((address, Some((Keychain::Internal, index))))
    }

    fn owned_derivation(&self, wallet_id: Uuid, script: &Script) -> Result<Option<(Keychain, u32)>> {
        Ok(self.registry.derivation_of(wallet_id, script)?)
    }

    pub(crate) fn previous_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.chain
            .raw_transaction(txid)
            .map_err(|e| SpendError::ChainUnavailable(e.to_string()))?
            .ok_or_else(|| SpendError::Build(format!("previous transaction {txid} not found")))
    }

    /// Current tip height, so the transaction cannot be mined into a reorganized past block.
    fn current_lock_time(&self) -> LockTime {
        match self.chain.block_height() {
            Ok(height) => LockTime::from_height(height).unwrap_or(LockTime::ZERO),
            Err(e) => {
                warn!(error = %e, "block height unavailable, using zero locktime");
                LockTime::ZERO
            }
        }
    }
}

fn resolve_outputs(req: &CreateSpendRequest, network: BtcNetwork) -> Result<Vec<ResolvedOutput>> {
    let raw: Vec<(&str, Option<u64>)> = match (&req.recipient, &req.outputs) {
        (Some(_), Some(_)) => {
            return Err(SpendError::InvalidRequest(
                "give either recipient or outputs, not both".into(),
            ))
        }
        (None, None) => return Err(SpendError::InvalidRequest("no recipient given".into())),
        (Some(recipient), None) => vec![(recipient.as_str(), req.amount)],
        (None, Some(outputs)) => {
            if req.amount.is_some() {
                return Err(SpendError::InvalidRequest(
                    "amount belongs on each output when outputs are given".into(),
                ));
            }
            if outputs.is_empty() {
                return Err(SpendError::InvalidRequest("outputs is empty".into()));
            }
            outputs.iter().map(|o| (o.address.as_str(), o.amount)).collect()
        }
    };

    let without_amount = raw.iter().filter(|(_, amount)| amount.is_none()).count();
    if req.send_max {
        if without_amount != 1 {
            return Err(SpendError::InvalidRequest(
                "sendMax needs exactly one output without an amount".into(),
            ));
        }
        if req.subtract_fees {
            return Err(SpendError::InvalidRequest(
                "sendMax already pays the fee from the output".into(),
            ));
        }
    } else if without_amount > 0 {
        return Err(SpendError::InvalidRequest("every output needs an amount".into()));
    }
    if req.subtract_fees && raw.len() != 1 {
        return Err(SpendError::InvalidRequest(
            "subtractFees needs exactly one recipient".into(),
        ));
    }

    raw.into_iter()
        .map(|(address, amount)| {
            Ok(ResolvedOutput {
                address: parse_address(address, network)?,
                payment: amount.map(Payment::Fixed).unwrap_or(Payment::SendMax),
            })
        })
        .collect()
}

/// Validate caller-chosen coins, keeping their order and dropping repeats.
fn explicit_coins(
    records: &[UtxoRecord],
    pool: &CoinPool,
    ids: Option<&[OutPoint]>,
) -> Result<Vec<Utxo>> {
    let Some(ids) = ids else {
        return Ok(Vec::new());
    };
    let mut seen = HashSet::new();
    let mut coins = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            continue;
        }
        if let Some(record) = pool.eligible.iter().find(|r| r.outpoint() == *id) {
            coins.push(record.utxo.clone());
            continue;
        }
        if let Some((_, reason)) = pool.ineligible.iter().find(|(r, _)| r.outpoint() == *id) {
            return Err(SpendError::UtxoNotEligible {
                outpoint: *id,
                reason: *reason,
            });
        }
        if records.iter().any(|r| r.outpoint() == *id && r.spent) {
            return Err(SpendError::UtxoNotEligible {
                outpoint: *id,
                reason: Ineligibility::Spent,
            });
        }
        return Err(SpendError::UtxoNotFound(*id));
    }
    Ok(coins)
}

fn with_coin_counts(e: BtcError, pool: &CoinPool) -> SpendError {
    match e {
        BtcError::InsufficientFunds {
            available_sat,
            required_sat,
        } => SpendError::InsufficientFunds {
            available_sat,
            required_sat,
            eligible_utxos: pool.eligible.len(),
            total_utxos: pool.total(),
        },
        other => other.into(),
    }
}
