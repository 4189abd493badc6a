//! Drafts: spends waiting for signatures from several devices.
//!
//! A draft locks its coins from creation until it is broadcast, deleted or
//! expires. Every mutation goes through a compare-and-swap on the draft's
//! `version`, so two devices submitting at once cannot lose a signature.

use chain_btc::psbt::{
    combine_signatures, decode_psbt, encode_psbt, has_signatures, signature_count,
    verify_partial_signatures,
};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{CreateSpendRequest, SubmitSignatureRequest, SweepReport, UpdateDraftRequest};
use crate::error::{Result, SpendError};
use crate::types::{Draft, DraftStatus};
use crate::SpendService;

impl SpendService {
    /// Build a spend and store it as a draft, locking its coins.
    ///
    /// Fails with [`SpendError::LockConflict`] if another spend grabbed one of
    /// the selected coins in the meantime; nothing is stored in that case.
    pub fn create_draft(
        &self,
        wallet_id: Uuid,
        created_by: Uuid,
        req: &CreateSpendRequest,
    ) -> Result<Draft> {
        let built = self.build_spend(wallet_id, req)?;
        let now = self.clock.now();
        let draft = Draft {
            id: Uuid::new_v4(),
            wallet_id,
            created_by,
            outputs: built.outputs,
            amount: built.amount,
            fee_rate: req.fee_rate,
            utxo_ids: built.utxo_ids,
            fee: built.response.fee,
            change_amount: built.response.change_amount,
            change_address: built.response.change_address,
            total_input: built.response.total_input,
            total_output: built.response.total_output,
            psbt_base64: built.response.psbt_base64,
            signed_psbt_base64: None,
            signed_device_ids: Vec::new(),
            required_signatures: built.required_signatures,
            status: DraftStatus::Unsigned,
            enable_rbf: req.enable_rbf,
            label: None,
            memo: None,
            expires_at: now + self.config.draft_ttl(),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.ledger
            .insert_draft_locked(draft.clone(), now)
            .inspect_err(|e| warn!(%wallet_id, error = %e, "draft not stored"))?;
        info!(
            %wallet_id,
            draft_id = %draft.id,
            inputs = draft.utxo_ids.len(),
            required = draft.required_signatures,
            "draft created"
        );
        Ok(draft)
    }

    pub fn get_draft(&self, draft_id: Uuid) -> Result<Draft> {
        self.ledger
            .get_draft(draft_id)?
            .ok_or(SpendError::DraftNotFound(draft_id))
    }

    /// Drafts of a wallet, newest first.
    pub fn list_drafts(&self, wallet_id: Uuid) -> Result<Vec<Draft>> {
        Ok(self.ledger.list_drafts(wallet_id)?)
    }

    /// Change a draft's label, memo or expiry.
    ///
    /// Empty strings clear the label or memo. A new expiry must lie in the
    /// future and within the configured draft lifetime; the coin locks move
    /// with it.
    pub fn update_draft(&self, draft_id: Uuid, req: &UpdateDraftRequest) -> Result<Draft> {
        let now = self.clock.now();
        let mut draft = self.live_draft(draft_id, now)?;

        if let Some(label) = &req.label {
            draft.label = non_empty(label);
        }
        if let Some(memo) = &req.memo {
            draft.memo = non_empty(memo);
        }
        if let Some(expires_at) = req.expires_at {
            if expires_at <= now {
                return Err(SpendError::InvalidRequest("expiresAt must be in the future".into()));
            }
            if expires_at > now + self.config.draft_ttl() {
                return Err(SpendError::InvalidRequest(format!(
                    "expiresAt may be at most {} seconds ahead",
                    self.config.draft_ttl_secs
                )));
            }
            draft.expires_at = expires_at;
        }
        draft.updated_at = now;

        let updated = self
            .ledger
            .update_if_version_matches(draft, req.expected_version, now)?;
        info!(%draft_id, version = updated.version, "draft updated");
        Ok(updated)
    }

    /// Remove a draft and free its coins.
    pub fn delete_draft(&self, draft_id: Uuid) -> Result<()> {
        let draft = self
            .ledger
            .delete_draft(draft_id)?
            .ok_or(SpendError::DraftNotFound(draft_id))?;
        info!(%draft_id, wallet_id = %draft.wallet_id, "draft deleted");
        Ok(())
    }

    /// Merge one device's signatures into a draft.
    ///
    /// The fragment must be the draft's own transaction and carry at least one
    /// valid signature. A new device must add a signature the draft does not
    /// hold yet. A device that already signed can resubmit without being
    /// counted twice. Nothing changes when any check fails.
    pub fn submit_signature(&self, draft_id: Uuid, req: &SubmitSignatureRequest) -> Result<Draft> {
        let now = self.clock.now();
        let mut draft = self.live_draft(draft_id, now)?;

        let fragment = decode_psbt(&req.signed_psbt_base64)
            .map_err(|e| SpendError::InvalidSignature(e.to_string()))?;
        if !has_signatures(&fragment) {
            return Err(SpendError::InvalidSignature(
                "signed PSBT carries no signatures".into(),
            ));
        }
        let base = decode_psbt(draft.latest_psbt())?;
        let combined = combine_signatures(&base, &fragment)?;
        verify_partial_signatures(&combined)?;

        let added = signature_count(&combined).saturating_sub(signature_count(&base));
        if added == 0 && !draft.signed_device_ids.contains(&req.device_id) {
            return Err(SpendError::InvalidSignature(
                "signed PSBT adds no new signature".into(),
            ));
        }
        let first_signature = draft.add_signer(req.device_id);
        let next = DraftStatus::for_signers(draft.signed_device_ids.len(), draft.required_signatures);
        draft.status = draft.status.advance(next);
        draft.signed_psbt_base64 = Some(encode_psbt(&combined));
        draft.updated_at = now;

        let updated = self
            .ledger
            .update_if_version_matches(draft, req.expected_version, now)
            .inspect_err(|e| warn!(%draft_id, device_id = %req.device_id, error = %e, "signature not stored"))?;
        info!(
            %draft_id,
            device_id = %req.device_id,
            signers = updated.signed_device_ids.len(),
            required = updated.required_signatures,
            status = ?updated.status,
            repeat = !first_signature,
            "signature accepted"
        );
        Ok(updated)
    }

    /// Delete expired drafts and release every expired coin lock.
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        for draft in self.ledger.expired_drafts(now)? {
            if self.ledger.delete_draft(draft.id)?.is_some() {
                report.drafts_deleted += 1;
            }
        }
        report.locks_released = self.ledger.release_expired_locks(now)?;
        if report.drafts_deleted > 0 || report.locks_released > 0 {
            info!(
                drafts = report.drafts_deleted,
                locks = report.locks_released,
                "expired spends swept"
            );
        }
        Ok(report)
    }

    pub(crate) fn live_draft(&self, draft_id: Uuid, now: DateTime<Utc>) -> Result<Draft> {
        let draft = self.get_draft(draft_id)?;
        if draft.is_expired(now) {
            return Err(SpendError::DraftExpired(draft_id));
        }
        Ok(draft)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::non_empty;

    #[test]
    fn blank_text_clears_the_field() {
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty(" rent "), Some("rent".to_string()));
    }
}
