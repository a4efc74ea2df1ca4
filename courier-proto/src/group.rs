//! Group metadata and membership lifecycle changes.
//!
//! Membership changes are applied with set semantics: joining twice or
//! leaving twice leaves the group in the same state as doing it once, so a
//! client that receives a change it already applied locally is unaffected.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::{GroupId, UserId};

/// A group as resolved from the external group store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    /// Group identifier.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Current owner.
    pub owner_id: UserId,
    /// Current members, including the owner.
    pub member_ids: BTreeSet<UserId>,
}

impl Group {
    /// A group whose only member is its owner.
    #[must_use]
    pub fn new(id: GroupId, name: impl Into<String>, owner_id: UserId) -> Self {
        let member_ids = BTreeSet::from([owner_id.clone()]);
        Self {
            id,
            name: name.into(),
            owner_id,
            member_ids,
        }
    }

    /// Builder-style helper that adds members.
    #[must_use]
    pub fn with_members(mut self, members: impl IntoIterator<Item = UserId>) -> Self {
        self.member_ids.extend(members);
        self
    }

    /// Whether `user` currently belongs to the group.
    #[must_use]
    pub fn is_member(&self, user: &UserId) -> bool {
        self.member_ids.contains(user)
    }

    /// Applies a change addressed to this group.
    ///
    /// Returns `true` if the group changed. Changes for other groups and
    /// [`MembershipChange::Deleted`] leave the group untouched; deletion is
    /// handled by whoever owns the collection of groups.
    pub fn apply(&mut self, change: &MembershipChange) -> bool {
        if change.group_id() != &self.id {
            return false;
        }
        match change {
            MembershipChange::Created(group) | MembershipChange::Added { group, .. } => {
                let before = self.member_ids.len();
                self.member_ids.extend(group.member_ids.iter().cloned());
                let renamed = self.name != group.name || self.owner_id != group.owner_id;
                if renamed {
                    self.name.clone_from(&group.name);
                    self.owner_id = group.owner_id.clone();
                }
                let added = match change {
                    MembershipChange::Added { user_id, .. } => self.member_ids.insert(user_id.clone()),
                    _ => false,
                };
                renamed || added || self.member_ids.len() != before
            }
            MembershipChange::Joined { user_id, .. } => self.member_ids.insert(user_id.clone()),
            MembershipChange::MemberLeft {
                user_id, new_owner, ..
            } => {
                let removed = self.member_ids.remove(user_id);
                let transferred = match new_owner {
                    Some(owner) if *owner != self.owner_id => {
                        self.owner_id = owner.clone();
                        true
                    }
                    _ => false,
                };
                removed || transferred
            }
            MembershipChange::Deleted { .. } => false,
        }
    }
}

/// A membership lifecycle event, as broadcast to affected users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    /// A group was created.
    Created(Group),
    /// A user joined an existing group.
    Joined {
        /// Group that gained the member.
        group_id: GroupId,
        /// The new member.
        user_id: UserId,
    },
    /// A user was added to a group by someone else.
    Added {
        /// The group as it stands after the addition.
        group: Group,
        /// The added user.
        user_id: UserId,
    },
    /// A member left (or was removed), possibly transferring ownership.
    MemberLeft {
        /// Group that lost the member.
        group_id: GroupId,
        /// The departing member.
        user_id: UserId,
        /// New owner, if the departing member owned the group.
        new_owner: Option<UserId>,
    },
    /// The group was deleted.
    Deleted {
        /// The deleted group.
        group_id: GroupId,
        /// Members at the time of deletion.
        member_ids: BTreeSet<UserId>,
    },
}

impl MembershipChange {
    /// The group this change concerns.
    #[must_use]
    pub const fn group_id(&self) -> &GroupId {
        match self {
            Self::Created(group) | Self::Added { group, .. } => &group.id,
            Self::Joined { group_id, .. }
            | Self::MemberLeft { group_id, .. }
            | Self::Deleted { group_id, .. } => group_id,
        }
    }
}

/// A [`MembershipChange`] stamped with the revision the store assigned it.
///
/// Revisions increase with every change the store makes. The same update
/// delivered twice carries the same revision, while a user who leaves and
/// rejoins produces two `Joined` changes with different revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipUpdate {
    /// Store-assigned revision.
    pub revision: u64,
    /// The change itself.
    pub change: MembershipChange,
}

impl MembershipChange {
    /// Stamps the change with a store revision.
    #[must_use]
    pub const fn at(self, revision: u64) -> MembershipUpdate {
        MembershipUpdate {
            revision,
            change: self,
        }
    }
}
