//! Bidirectional mapping between notifyable identity and repository paths.
//!
//! A notifyable's key is its repository path:
//! `/<clusterlib>/<version>/root[/<kind-prefix>/<name>]*`.  Internal znodes
//! (locks, bids, documents, markers) hang off a notifyable's key under
//! underscore-prefixed names, which is why user-visible names may not start
//! with an underscore.

use crate::{
    error::{Error, Result},
    repository::SEQUENCE_NUMBER_WIDTH,
};

pub const KEY_SEPARATOR: &str = "/";
pub const CLUSTERLIB: &str = "_clusterlib";
pub const CLUSTERLIB_VERSION: &str = "_1.0";
pub const ROOT_NAME: &str = "root";

/// Ready sentinel: a notifyable's znode data equals this exact string once
/// the notifyable is usable.
pub const READY_VALUE: &str = "ready";

pub const LOCK_DIR: &str = "_locks";
pub const LEADERSHIP_BIDS: &str = "_leadershipBids";
pub const CURRENT_LEADER: &str = "_currentLeader";
pub const BID_PREFIX: &str = "bid-";
pub const CONNECTED: &str = "_connected";
pub const CLIENT_STATE: &str = "_clientState";
pub const CLIENT_STATE_DESC: &str = "_clientStateDesc";
pub const QUEUE_ELEMENTS: &str = "_queueElements";
pub const QUEUE_ELEMENT_PREFIX: &str = "element-";

pub const KEYVAL_JSON_OBJECT: &str = "_keyValJSONObject";
pub const CURRENT_STATE_JSON_OBJECT: &str = "_currentStateJSONObject";
pub const DESIRED_STATE_JSON_OBJECT: &str = "_desiredStateJSONObject";
pub const SHARD_JSON_OBJECT: &str = "_shardJSONObject";
pub const PROCESSINFO_JSON_OBJECT: &str = "_processInfoJSONObject";
pub const PROCESSSLOTINFO_JSON_OBJECT: &str = "_processSlotInfoJSONObject";

/// Component counts when splitting a key on `/` (the leading empty string
/// counts, so the root key has four components).
pub const ROOT_COMPONENTS_COUNT: usize = 4;
pub const APP_COMPONENTS_COUNT: usize = 6;
pub const NODE_COMPONENTS_MIN_COUNT: usize = 8;
pub const PROCESSSLOT_COMPONENTS_MIN_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyableKind {
    Root,
    Application,
    Group,
    Node,
    ProcessSlot,
    DataDistribution,
    PropertyList,
    Queue,
}

impl NotifyableKind {
    /// Name of the child container znode holding notifyables of this kind.
    pub fn prefix(self) -> Option<&'static str> {
        match self {
            NotifyableKind::Root => None,
            NotifyableKind::Application => Some("_applications"),
            NotifyableKind::Group => Some("_groups"),
            NotifyableKind::Node => Some("_nodes"),
            NotifyableKind::ProcessSlot => Some("_processSlots"),
            NotifyableKind::DataDistribution => Some("_distributions"),
            NotifyableKind::PropertyList => Some("_propertyLists"),
            NotifyableKind::Queue => Some("_queues"),
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "_applications" => Some(NotifyableKind::Application),
            "_groups" => Some(NotifyableKind::Group),
            "_nodes" => Some(NotifyableKind::Node),
            "_processSlots" => Some(NotifyableKind::ProcessSlot),
            "_distributions" => Some(NotifyableKind::DataDistribution),
            "_propertyLists" => Some(NotifyableKind::PropertyList),
            "_queues" => Some(NotifyableKind::Queue),
            _ => None,
        }
    }

    /// Which kinds may live directly beneath a notifyable of this kind.
    pub fn allowed_children(self) -> &'static [NotifyableKind] {
        use NotifyableKind::*;
        match self {
            Root => &[Application, PropertyList, Queue],
            Application | Group => &[Group, Node, DataDistribution, PropertyList, Queue],
            Node => &[ProcessSlot, PropertyList, Queue],
            ProcessSlot | DataDistribution => &[PropertyList],
            PropertyList | Queue => &[],
        }
    }
}

pub fn root_key() -> String {
    format!("/{CLUSTERLIB}/{CLUSTERLIB_VERSION}/{ROOT_NAME}")
}

/// Validates a user-visible notifyable name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArguments("empty notifyable name".to_string()));
    }
    if name.contains(KEY_SEPARATOR) {
        return Err(Error::InvalidArguments(format!(
            "notifyable name {name} must not contain '{KEY_SEPARATOR}'"
        )));
    }
    if name.starts_with('_') {
        return Err(Error::InvalidArguments(format!(
            "notifyable name {name} must not start with '_'"
        )));
    }
    Ok(())
}

/// Path of the child container of `kind` under a notifyable.
pub fn child_container_path(parent_key: &str, kind: NotifyableKind) -> Result<String> {
    let prefix = kind.prefix().ok_or_else(|| {
        Error::InvalidArguments("the root is never a child notifyable".to_string())
    })?;
    Ok(format!("{parent_key}/{prefix}"))
}

/// Key of a named child notifyable.
pub fn child_key(parent_key: &str, kind: NotifyableKind, name: &str) -> Result<String> {
    validate_name(name)?;
    Ok(format!("{}/{name}", child_container_path(parent_key, kind)?))
}

/// Path of an internal znode directly under a notifyable.
pub fn internal_znode(key: &str, name: &str) -> String {
    format!("{key}/{name}")
}

pub fn name_from_key(key: &str) -> String {
    key.rsplit(KEY_SEPARATOR).next().unwrap_or("").to_string()
}

/// The kind encoded in a key's trailing `<prefix>/<name>` pair.
pub fn kind_from_key(key: &str) -> Result<NotifyableKind> {
    if key == root_key() {
        return Ok(NotifyableKind::Root);
    }
    let components: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if components.len() < APP_COMPONENTS_COUNT {
        return Err(Error::InvalidArguments(format!(
            "{key} is not a notifyable key"
        )));
    }
    let prefix = components[components.len() - 2];
    NotifyableKind::from_prefix(prefix)
        .ok_or_else(|| Error::InvalidArguments(format!("{key} has unknown kind prefix {prefix}")))
}

/// Key of the parent notifyable, or `None` for the root.
pub fn parent_key(key: &str) -> Option<String> {
    let removed = remove_object_from_key(key);
    (!removed.is_empty()).then_some(removed)
}

///
/// Drops the trailing notifyable (its name and kind prefix) from a key.
/// Returns the empty string once the walk would climb past the root.
///
pub fn remove_object_from_key(key: &str) -> String {
    let components: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if components.len() < ROOT_COMPONENTS_COUNT + 2 {
        return String::new();
    }
    components[..components.len() - 2].join(KEY_SEPARATOR)
}

/// Whether `key` is structurally a valid key for `kind`.
pub fn is_valid_key(kind: NotifyableKind, key: &str) -> bool {
    match kind_from_key(key) {
        Ok(found) => found == kind,
        Err(_) => false,
    }
}

/// Keys of the ancestor property lists sharing `name`, nearest first, used
/// by the property-list parent search.
pub fn ancestor_property_list_keys(property_list_key: &str, name: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = property_list_key.to_string();
    loop {
        // Remove the property list itself, then one enclosing notifyable.
        let ancestor = remove_object_from_key(&remove_object_from_key(&current));
        if ancestor.is_empty() {
            break;
        }
        let Ok(key) = child_key(&ancestor, NotifyableKind::PropertyList, name) else {
            break;
        };
        keys.push(key.clone());
        if ancestor == root_key() {
            break;
        }
        current = key;
    }
    keys
}

/// The lock directory of a named lock under a notifyable.
pub fn lock_dir(key: &str, lock_name: &str) -> String {
    format!("{key}/{LOCK_DIR}/{lock_name}")
}

const _: () = assert!(SEQUENCE_NUMBER_WIDTH == 10);

#[cfg(test)]
mod tests {
    use super::*;

    fn app_key() -> String {
        child_key(&root_key(), NotifyableKind::Application, "app").expect("bad key")
    }

    #[test]
    fn keys_round_trip_through_kind_and_name() {
        let group = child_key(&app_key(), NotifyableKind::Group, "g1").expect("bad key");
        assert_eq!(
            group,
            "/_clusterlib/_1.0/root/_applications/app/_groups/g1"
        );
        assert_eq!(kind_from_key(&group).expect("no kind"), NotifyableKind::Group);
        assert_eq!(name_from_key(&group), "g1");
        assert_eq!(parent_key(&group).expect("no parent"), app_key());
    }

    #[test]
    fn root_key_has_no_parent() {
        assert_eq!(kind_from_key(&root_key()).expect("no kind"), NotifyableKind::Root);
        assert!(parent_key(&root_key()).is_none());
    }

    #[test]
    fn component_counts_match_the_layout() {
        assert_eq!(root_key().split('/').count(), ROOT_COMPONENTS_COUNT);
        assert_eq!(app_key().split('/').count(), APP_COMPONENTS_COUNT);
        let node = child_key(&app_key(), NotifyableKind::Node, "n").expect("bad key");
        assert_eq!(node.split('/').count(), NODE_COMPONENTS_MIN_COUNT);
        let slot = child_key(&node, NotifyableKind::ProcessSlot, "s").expect("bad key");
        assert_eq!(slot.split('/').count(), PROCESSSLOT_COMPONENTS_MIN_COUNT);
    }

    #[test]
    fn remove_object_walks_one_notifyable_at_a_time() {
        let group = child_key(&app_key(), NotifyableKind::Group, "g1").expect("bad key");
        assert_eq!(remove_object_from_key(&group), app_key());
        assert_eq!(remove_object_from_key(&app_key()), root_key());
        assert_eq!(remove_object_from_key(&root_key()), "");
    }

    #[test]
    fn names_may_not_collide_with_internal_znodes() {
        assert!(validate_name("server-0").is_ok());
        assert!(validate_name("_locks").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn ancestor_property_list_search_ascends_to_the_root() {
        let group = child_key(&app_key(), NotifyableKind::Group, "g1").expect("bad key");
        let plist = child_key(&group, NotifyableKind::PropertyList, "conf").expect("bad key");
        let ancestors = ancestor_property_list_keys(&plist, "conf");
        assert_eq!(
            ancestors,
            vec![
                child_key(&app_key(), NotifyableKind::PropertyList, "conf").expect("bad key"),
                child_key(&root_key(), NotifyableKind::PropertyList, "conf").expect("bad key"),
            ]
        );
    }
}
