//! Command allow-list.

use std::collections::HashSet;

/// Programs the server may run, fixed at startup.
///
/// An empty list places no restriction on what clients can execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    programs: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            programs: programs.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether any restriction is configured.
    pub fn is_restricted(&self) -> bool {
        !self.programs.is_empty()
    }

    /// Whether `program` (argv[0], compared verbatim) may be spawned.
    pub fn permits(&self, program: &str) -> bool {
        !self.is_restricted() || self.programs.contains(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_permits_everything() {
        let allow = AllowList::default();
        assert!(!allow.is_restricted());
        assert!(allow.permits("ls"));
        assert!(allow.permits("rm"));
    }

    #[test]
    fn test_configured_list() {
        let allow = AllowList::new(["ls", "top"]);
        assert!(allow.is_restricted());
        assert!(allow.permits("ls"));
        assert!(allow.permits("top"));
        assert!(!allow.permits("rm"));
    }

    #[test]
    fn test_matching_is_exact() {
        let allow = AllowList::new(["ls"]);
        assert!(!allow.permits("/bin/ls"));
        assert!(!allow.permits("LS"));
        assert!(!allow.permits("ls "));
        assert!(!allow.permits(""));
    }
}
