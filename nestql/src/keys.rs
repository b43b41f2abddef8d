/// Redis key layout for one store namespace.
///
/// * `{ns}:res:{resource}`: hash, identity key to JSON row
/// * `{ns}:assoc:{table}`: hash, JSON association row to `1`
/// * `{ns}:version`: integer bumped by every commit
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub namespace: &'a str,
}

impl<'a> KeyContext<'a> {
    pub fn new(namespace: &'a str) -> Self {
        Self { namespace }
    }

    pub fn resource(&self, resource: &str) -> String {
        format!("{}:res:{}", self.namespace, resource)
    }

    pub fn association(&self, table: &str) -> String {
        format!("{}:assoc:{}", self.namespace, table)
    }

    pub fn version(&self) -> String {
        format!("{}:version", self.namespace)
    }

    /// Pattern matching every key of the namespace.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_namespaced_keys() {
        let keys = KeyContext::new("chinook");
        assert_eq!(keys.resource("albums"), "chinook:res:albums");
        assert_eq!(keys.association("playlist_track"), "chinook:assoc:playlist_track");
        assert_eq!(keys.version(), "chinook:version");
        assert_eq!(keys.pattern(), "chinook:*");
    }
}
