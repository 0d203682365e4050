//! Device lists per user and participant lists per group.

use std::collections::HashSet;

use courier_shared::ids::{DeviceAddress, GroupId, Jid, UserId};
use courier_shared::node::Node;
use dashmap::DashMap;

use crate::client::ClientInner;
use crate::error::ClientError;

#[derive(Default)]
pub struct DeviceCache {
    users: DashMap<UserId, Vec<u32>>,
    groups: DashMap<GroupId, Vec<UserId>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices_of(&self, user: &UserId) -> Option<Vec<u32>> {
        self.users.get(user).map(|d| d.clone())
    }

    pub fn store_devices(&self, user: UserId, mut devices: Vec<u32>) {
        devices.sort_unstable();
        devices.dedup();
        self.users.insert(user, devices);
    }

    pub fn participants(&self, group: &GroupId) -> Option<Vec<UserId>> {
        self.groups.get(group).map(|p| p.clone())
    }

    pub fn store_participants(&self, group: GroupId, participants: Vec<UserId>) {
        self.groups.insert(group, participants);
    }

    pub fn invalidate_user(&self, user: &UserId) {
        self.users.remove(user);
    }

    /// Forget the group and every member's device list.
    pub fn invalidate_group(&self, group: &GroupId) {
        if let Some((_, participants)) = self.groups.remove(group) {
            for user in participants {
                self.users.remove(&user);
            }
        }
    }
}

pub(crate) fn usync_request(users: &[UserId]) -> Node {
    let list = users
        .iter()
        .map(|user| Node::new("user").attr("jid", *user))
        .collect();
    Node::new("iq")
        .attr("type", "get")
        .attr("xmlns", "usync")
        .with_children(vec![
            Node::new("usync").with_children(vec![Node::new("list").with_children(list)])
        ])
}

pub(crate) fn parse_usync_response(response: &Node) -> Result<Vec<(UserId, Vec<u32>)>, ClientError> {
    let list = response.require_child("usync")?.require_child("list")?;
    let mut result = Vec::new();
    for user in list.children_by_tag("user") {
        let jid = user.jid_attr("jid")?;
        let user_id = jid
            .user()
            .ok_or_else(|| ClientError::UnexpectedResponse(format!("usync entry for {jid}")))?;
        let mut devices = Vec::new();
        if let Some(list) = user.child("devices") {
            for device in list.children_by_tag("device") {
                let id = device.u64_attr("id")?;
                devices.push(u32::try_from(id).map_err(|_| {
                    ClientError::UnexpectedResponse(format!("device id {id} out of range"))
                })?);
            }
        }
        result.push((user_id, devices));
    }
    Ok(result)
}

/// Every known device of `users`, fetching unknown users in one request.
pub(crate) async fn resolve_devices(
    inner: &ClientInner,
    users: &[UserId],
) -> Result<Vec<DeviceAddress>, ClientError> {
    let mut seen = HashSet::new();
    let unique: Vec<UserId> = users.iter().copied().filter(|u| seen.insert(*u)).collect();
    let missing: Vec<UserId> = unique
        .iter()
        .copied()
        .filter(|u| inner.devices.devices_of(u).is_none())
        .collect();

    if !missing.is_empty() {
        let response = inner.send_iq(usync_request(&missing)).await?;
        let mut answered = HashSet::new();
        for (user, devices) in parse_usync_response(&response)? {
            answered.insert(user);
            inner.devices.store_devices(user, devices);
        }
        for user in missing.iter().filter(|u| !answered.contains(*u)) {
            tracing::debug!(user = %user, "user has no registered devices");
            inner.devices.store_devices(*user, Vec::new());
        }
    }

    Ok(unique
        .iter()
        .flat_map(|user| {
            inner
                .devices
                .devices_of(user)
                .unwrap_or_default()
                .into_iter()
                .map(|device| DeviceAddress::new(*user, device))
        })
        .collect())
}

pub(crate) fn group_query(group: &GroupId) -> Node {
    Node::new("iq")
        .attr("type", "get")
        .attr("xmlns", "w:g2")
        .attr("to", *group)
        .with_children(vec![Node::new("query").attr("request", "interactive")])
}

pub(crate) fn parse_group_response(response: &Node) -> Result<Vec<UserId>, ClientError> {
    let group = response.require_child("group")?;
    group
        .children_by_tag("participant")
        .map(|p| {
            let jid = p.jid_attr("jid")?;
            jid.user()
                .ok_or_else(|| ClientError::UnexpectedResponse(format!("participant {jid}")))
        })
        .collect()
}

pub(crate) async fn group_participants(
    inner: &ClientInner,
    group: &GroupId,
) -> Result<Vec<UserId>, ClientError> {
    if let Some(participants) = inner.devices.participants(group) {
        return Ok(participants);
    }
    let response = inner.send_iq(group_query(group)).await?;
    let participants = parse_group_response(&response)?;
    inner
        .devices
        .store_participants(*group, participants.clone());
    Ok(participants)
}

/// A `devices` notification tells us a user's device list changed.
pub(crate) fn handle_devices_notification(inner: &ClientInner, node: &Node) -> Result<(), ClientError> {
    if let Jid::User(user) | Jid::Device(DeviceAddress { user, .. }) = node.jid_attr("from")? {
        tracing::debug!(user = %user, "device list changed");
        inner.devices.invalidate_user(&user);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usync_response_round_trip() {
        let alice = UserId::new();
        let bob = UserId::new();
        let request = usync_request(&[alice, bob]);
        let users: Vec<Jid> = request
            .require_child("usync")
            .unwrap()
            .require_child("list")
            .unwrap()
            .children()
            .iter()
            .map(|n| n.jid_attr("jid").unwrap())
            .collect();
        assert_eq!(users, vec![Jid::User(alice), Jid::User(bob)]);

        let response = Node::new("iq").with_children(vec![Node::new("usync").with_children(vec![
            Node::new("list").with_children(vec![Node::new("user")
                .attr("jid", alice)
                .with_children(vec![Node::new("devices").with_children(vec![
                    Node::new("device").attr("id", 0u32),
                    Node::new("device").attr("id", 4u32),
                ])])]),
        ])]);
        assert_eq!(
            parse_usync_response(&response).unwrap(),
            vec![(alice, vec![0, 4])]
        );
    }

    #[test]
    fn invalidating_a_group_forgets_member_devices() {
        let cache = DeviceCache::new();
        let group = GroupId::new();
        let member = UserId::new();
        let outsider = UserId::new();
        cache.store_participants(group, vec![member]);
        cache.store_devices(member, vec![2, 0, 2]);
        cache.store_devices(outsider, vec![0]);

        assert_eq!(cache.devices_of(&member), Some(vec![0, 2]));
        cache.invalidate_group(&group);
        assert!(cache.participants(&group).is_none());
        assert!(cache.devices_of(&member).is_none());
        assert!(cache.devices_of(&outsider).is_some());
    }

    #[test]
    fn group_response_lists_participants() {
        let members = [UserId::new(), UserId::new()];
        let response = Node::new("iq").with_children(vec![Node::new("group").with_children(
            members
                .iter()
                .map(|u| Node::new("participant").attr("jid", *u))
                .collect(),
        )]);
        assert_eq!(parse_group_response(&response).unwrap(), members);
    }
}
