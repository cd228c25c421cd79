//! Ownership tracking for items committed to in-flight proposals.
//!
//! Each asset is recorded together with the proposal holding it, so an item
//! that appears in two proposals stays in trade until both let go.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{AssetId, ProposalId};

#[derive(Debug, Clone, Default)]
pub struct OwnershipTracker {
    by_asset: BTreeMap<AssetId, BTreeSet<ProposalId>>,
    by_holder: BTreeMap<ProposalId, BTreeSet<AssetId>>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit an asset to a proposal. Idempotent.
    pub fn mark_in_trade(&mut self, asset: &AssetId, holder: &ProposalId) {
        self.by_asset
            .entry(asset.clone())
            .or_default()
            .insert(holder.clone());
        self.by_holder
            .entry(holder.clone())
            .or_default()
            .insert(asset.clone());
    }

    pub fn mark_all<'a>(&mut self, assets: impl IntoIterator<Item = &'a AssetId>, holder: &ProposalId) {
        for asset in assets {
            self.mark_in_trade(asset, holder);
        }
    }

    /// Drop one proposal's hold on an asset. Idempotent.
    pub fn release(&mut self, asset: &AssetId, holder: &ProposalId) {
        if let Some(holders) = self.by_asset.get_mut(asset) {
            holders.remove(holder);
            if holders.is_empty() {
                self.by_asset.remove(asset);
            }
        }
        if let Some(assets) = self.by_holder.get_mut(holder) {
            assets.remove(asset);
            if assets.is_empty() {
                self.by_holder.remove(holder);
            }
        }
    }

    /// Drop every hold a proposal has. Returns the assets it held.
    pub fn release_proposal(&mut self, holder: &ProposalId) -> Vec<AssetId> {
        let assets = self.by_holder.remove(holder).unwrap_or_default();
        for asset in &assets {
            if let Some(holders) = self.by_asset.get_mut(asset) {
                holders.remove(holder);
                if holders.is_empty() {
                    self.by_asset.remove(asset);
                }
            }
        }
        assets.into_iter().collect()
    }

    /// Move all holds from one proposal id to another, e.g. once the remote
    /// assigns an id to a proposal we sent.
    pub fn rehome(&mut self, from: &ProposalId, to: &ProposalId) {
        let assets = self.release_proposal(from);
        self.mark_all(assets.iter(), to);
    }

    pub fn is_in_trade(&self, asset: &AssetId) -> bool {
        self.by_asset.contains_key(asset)
    }

    pub fn holders_of(&self, asset: &AssetId) -> Vec<ProposalId> {
        self.by_asset
            .get(asset)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every asset currently committed to some proposal.
    pub fn items(&self) -> BTreeSet<AssetId> {
        self.by_asset.keys().cloned().collect()
    }

    /// Assets committed to proposals other than `holder`.
    pub fn items_excluding(&self, holder: &ProposalId) -> BTreeSet<AssetId> {
        self.by_asset
            .iter()
            .filter(|(_, holders)| holders.iter().any(|h| h != holder))
            .map(|(asset, _)| asset.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_asset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_asset.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
