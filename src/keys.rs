//! Key namespace of the coordination store.
//!
//! Components never call each other directly; they agree on these key
//! shapes instead.

/// Prefix of published deployment units (`docker-image-<id>`).
pub const UNIT_PREFIX: &str = "docker-image";
/// Prefix of node liveness announcements (`running-keeper-<node>`).
pub const LIVENESS_PREFIX: &str = "running-keeper-";
/// Prefix of service registrations (`service-<service>-<id>`).
pub const REGISTRATION_PREFIX: &str = "service-";

pub fn unit(id: &str) -> String {
    format!("{UNIT_PREFIX}-{id}")
}

/// Acknowledgment key the scheduler watches during a rollout.
pub fn ack(service: &str) -> String {
    format!("rolling-update-{service}")
}

/// Full running set published by the agent on `node`.
pub fn running_set(node: &str) -> String {
    format!("keeper-{node}-image")
}

pub fn liveness(node: &str) -> String {
    format!("{LIVENESS_PREFIX}{node}")
}

pub fn removal_prefix(node: &str) -> String {
    format!("RM-{node}-")
}

pub fn removal(node: &str, id: &str) -> String {
    format!("{}{id}", removal_prefix(node))
}

pub fn detail(name: &str, id: &str) -> String {
    format!("image-{name}-{id}")
}

pub fn registration(service: &str, id: &str) -> String {
    format!("{REGISTRATION_PREFIX}{service}-{id}")
}

pub fn registration_prefix(service: &str) -> String {
    format!("{REGISTRATION_PREFIX}{service}-")
}

/// Splits `service-<service>-<id>` into `(service, id)`.  The id is the
/// last segment; service names may themselves contain `-`.
pub fn parse_registration(key: &str) -> Option<(&str, &str)> {
    let suffix = key.strip_prefix(REGISTRATION_PREFIX)?;
    let (service, id) = suffix.rsplit_once('-')?;
    if service.is_empty() || id.is_empty() {
        return None;
    }
    Some((service, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_key_round_trips_dashed_names() {
        let key = registration("image-api", "c0ffee");
        assert_eq!(key, "service-image-api-c0ffee");
        assert_eq!(parse_registration(&key), Some(("image-api", "c0ffee")));
    }

    #[test]
    fn malformed_registration_keys() {
        assert_eq!(parse_registration("service-"), None);
        assert_eq!(parse_registration("service-nodash"), None);
        assert_eq!(parse_registration("other-a-b"), None);
    }

    #[test]
    fn node_keys() {
        assert_eq!(running_set("node1"), "keeper-node1-image");
        assert_eq!(liveness("node1"), "running-keeper-node1");
        assert_eq!(removal("node1", "x"), "RM-node1-x");
        assert_eq!(unit("abc"), "docker-image-abc");
    }
}
