use std::collections::{HashMap, HashSet};

use shared::domain::{GroupId, UserId};
use tracing::{debug, warn};

/// Group membership from this client's perspective. Absence from the map is
/// the implicit `Unknown` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMembership {
    /// An invite names this group; no decision has been made yet.
    Invited,
    /// Invite accepted and announced upstream; awaiting the membership
    /// update for our own id. Readable, not sendable.
    Joining,
    Joined,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: HashSet<UserId>,
    pub membership: GroupMembership,
}

impl Group {
    fn new(id: GroupId, name: String, membership: GroupMembership) -> Self {
        Self {
            id,
            name,
            members: HashSet::new(),
            membership,
        }
    }
}

/// An invitation surfaced for a user decision. Consumed by
/// `respond_to_invite`, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInvite {
    pub group_id: GroupId,
    pub group_name: String,
    pub inviter: String,
}

#[derive(Debug)]
pub struct MembershipManager {
    own_user_id: UserId,
    groups: HashMap<GroupId, Group>,
}

impl MembershipManager {
    pub fn new(own_user_id: UserId) -> Self {
        Self {
            own_user_id,
            groups: HashMap::new(),
        }
    }

    pub fn group(&self, group_id: GroupId) -> Option<&Group> {
        self.groups.get(&group_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn can_send(&self, group_id: GroupId) -> bool {
        matches!(
            self.groups.get(&group_id).map(|group| group.membership),
            Some(GroupMembership::Joined)
        )
    }

    /// An invite for an unknown group enters `Invited`; a known group only
    /// has its name refreshed.
    pub fn note_invite(&mut self, invite: &GroupInvite) {
        match self.groups.get_mut(&invite.group_id) {
            Some(group) => group.name = invite.group_name.clone(),
            None => {
                self.groups.insert(
                    invite.group_id,
                    Group::new(
                        invite.group_id,
                        invite.group_name.clone(),
                        GroupMembership::Invited,
                    ),
                );
            }
        }
    }

    /// Consumes an invite decision. Returns true when the accept must be
    /// announced upstream. A decision for an unknown group is treated as a
    /// fresh invite, never an error.
    pub fn respond(&mut self, group_id: GroupId, accept: bool) -> bool {
        if accept {
            let group = self
                .groups
                .entry(group_id)
                .or_insert_with(|| Group::new(group_id, String::new(), GroupMembership::Invited));
            if group.membership == GroupMembership::Joined {
                debug!(group_id = group_id.0, "membership: accept for an already joined group");
                return false;
            }
            group.membership = GroupMembership::Joining;
            true
        } else {
            if matches!(
                self.groups.get(&group_id).map(|group| group.membership),
                Some(GroupMembership::Invited)
            ) {
                self.groups.remove(&group_id);
            }
            false
        }
    }

    /// `group_created` acknowledgement for a group this client initiated:
    /// the creator is a member immediately.
    pub fn confirm_created(&mut self, group_id: GroupId) {
        let own = self.own_user_id;
        let group = self
            .groups
            .entry(group_id)
            .or_insert_with(|| Group::new(group_id, String::new(), GroupMembership::Joined));
        group.membership = GroupMembership::Joined;
        group.members.insert(own);
    }

    /// Implicit creation on first push reference. The server is already
    /// delivering this group's traffic, so the record lands as `Joined`.
    pub fn ensure_known(&mut self, group_id: GroupId) {
        self.groups
            .entry(group_id)
            .or_insert_with(|| Group::new(group_id, String::new(), GroupMembership::Joined));
    }

    /// Applies a membership update. Our own id confirms `Joining -> Joined`;
    /// any other id only mutates the member set. Frames without a group id
    /// route to the unique group awaiting confirmation; anything else is
    /// unroutable and dropped.
    pub fn apply_member_joined(
        &mut self,
        group_id: Option<GroupId>,
        uid: UserId,
        user: &str,
    ) -> Option<GroupId> {
        let group_id = group_id.or_else(|| {
            let mut joining = self
                .groups
                .values()
                .filter(|group| group.membership == GroupMembership::Joining);
            match (joining.next(), joining.next()) {
                (Some(group), None) => Some(group.id),
                _ => None,
            }
        });

        let Some(group_id) = group_id else {
            warn!(uid = uid.0, user, "membership: member_joined without a routable group; dropped");
            return None;
        };

        let own = self.own_user_id;
        let group = self
            .groups
            .entry(group_id)
            .or_insert_with(|| Group::new(group_id, String::new(), GroupMembership::Joined));
        group.members.insert(uid);
        if uid == own && group.membership != GroupMembership::Joined {
            debug!(group_id = group_id.0, "membership: own join confirmed");
            group.membership = GroupMembership::Joined;
        }
        Some(group_id)
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
