// Versioned (V2) group state: apply consecutive deltas, refetch on gaps

use async_trait::async_trait;
use tracing::{debug, warn};

use super::GroupError;
use crate::message::{GroupChange, GroupContextV2, GroupIdV2};
use crate::pipeline::Job;
use crate::store::{GroupStore, GroupV2State, StoreError};

/// Fetches the authoritative state of a V2 group from the group service
#[async_trait]
pub trait GroupStateFetcher: Send + Sync {
    async fn fetch_group(&self, group_id: &GroupIdV2) -> Result<GroupV2State, GroupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// State advanced to this revision
    Applied(u32),
    /// Revision at or below local; nothing changed
    AlreadyApplied,
    /// Delta does not follow the local revision; state untouched
    Gap { local: u32, incoming: u32 },
}

/// Apply `change` on top of `state` if it is exactly the next revision
pub fn apply_delta(state: &mut GroupV2State, change: &GroupChange) -> DeltaOutcome {
    if change.revision <= state.revision {
        return DeltaOutcome::AlreadyApplied;
    }
    if change.revision != state.revision + 1 {
        return DeltaOutcome::Gap {
            local: state.revision,
            incoming: change.revision,
        };
    }

    for member in &change.add_members {
        state.add_member(member);
    }
    for member in &change.remove_members {
        state.remove_member(member);
    }
    if let Some(title) = &change.title {
        state.title = Some(title.clone());
    }
    if let Some(timer) = change.expiration_timer {
        state.message_expiration_time = timer;
    }
    state.revision = change.revision;
    DeltaOutcome::Applied(change.revision)
}

/// Bring local state in line with an incoming V2 context. Returns a refresh
/// job when the group is unknown or the delta leaves a gap.
pub fn reconcile_v2(store: &GroupStore, context: &GroupContextV2) -> Result<Vec<Job>, StoreError> {
    let group_hex = hex::encode(context.id);
    let Some(mut state) = store.get_v2(&context.id)? else {
        debug!(group = %group_hex, "unknown v2 group, scheduling fetch");
        return Ok(vec![Job::RefreshGroupV2(context.id)]);
    };

    if context.revision <= state.revision {
        return Ok(Vec::new());
    }

    let Some(change) = &context.change else {
        return Ok(vec![Job::RefreshGroupV2(context.id)]);
    };

    match apply_delta(&mut state, change) {
        DeltaOutcome::Applied(revision) => {
            store.update_v2(&state)?;
            debug!(group = %group_hex, revision, "applied group delta");
            Ok(Vec::new())
        }
        DeltaOutcome::AlreadyApplied => Ok(Vec::new()),
        DeltaOutcome::Gap { local, incoming } => {
            warn!(group = %group_hex, local, incoming, "group revision gap, refetching");
            Ok(vec![Job::RefreshGroupV2(context.id)])
        }
    }
}

/// Replace local state with fetched state unless local is already newer
pub fn store_fetched_state(store: &GroupStore, fetched: &GroupV2State) -> Result<bool, StoreError> {
    if let Some(local) = store.get_v2(&fetched.group_id)? {
        if local.revision > fetched.revision {
            return Ok(false);
        }
    }
    store.update_v2(fetched)?;
    Ok(true)
}
