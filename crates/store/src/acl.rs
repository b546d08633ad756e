use std::collections::{HashMap, HashSet};

use crate::StoreError;

/// The implicit superuser; always present and never removable.
pub const DEFAULT_USER: &str = "default";

#[derive(Clone, Debug)]
enum CommandSet {
    All,
    Named(HashSet<String>),
}

/// A single ACL identity: enabled flag, passwords, key patterns, and the
/// commands it may run.
#[derive(Clone, Debug)]
pub struct AclUser {
    enabled: bool,
    passwords: Vec<String>,
    key_patterns: Vec<String>,
    commands: CommandSet,
}

impl AclUser {
    fn new() -> Self {
        Self {
            enabled: false,
            passwords: Vec::new(),
            key_patterns: Vec::new(),
            commands: CommandSet::Named(HashSet::new()),
        }
    }

    fn superuser() -> Self {
        Self {
            enabled: true,
            passwords: Vec::new(),
            key_patterns: vec!["*".to_owned()],
            commands: CommandSet::All,
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn permits_command(&self, cmd: &str) -> bool {
        match &self.commands {
            CommandSet::All => true,
            CommandSet::Named(set) => set.contains(&cmd.to_ascii_lowercase()),
        }
    }

    #[must_use]
    pub fn permits_key(&self, key: &str) -> bool {
        self.key_patterns.iter().any(|p| glob_match(p, key))
    }

    fn check_password(&self, password: &str) -> bool {
        self.passwords.iter().any(|p| p == password)
    }

    fn apply_rule(&mut self, rule: &str) -> Result<(), StoreError> {
        match rule {
            "on" => self.enabled = true,
            "off" => self.enabled = false,
            "allkeys" => self.key_patterns.push("*".to_owned()),
            "allcommands" => self.commands = CommandSet::All,
            _ => {
                if let Some(password) = rule.strip_prefix('>') {
                    self.passwords.push(password.to_owned());
                } else if let Some(pattern) = rule.strip_prefix('~') {
                    self.key_patterns.push(pattern.to_owned());
                } else if let Some(cmd) = rule.strip_prefix('+') {
                    if cmd == "@all" {
                        self.commands = CommandSet::All;
                    } else if let CommandSet::Named(set) = &mut self.commands {
                        set.insert(cmd.to_ascii_lowercase());
                    }
                } else if let Some(cmd) = rule.strip_prefix('-') {
                    if let CommandSet::Named(set) = &mut self.commands {
                        set.remove(&cmd.to_ascii_lowercase());
                    }
                } else {
                    return Err(StoreError::InvalidAclRule(rule.to_owned()));
                }
            }
        }
        Ok(())
    }
}

/// Process-wide user table.
#[derive(Debug)]
pub struct Acl {
    users: HashMap<String, AclUser>,
}

impl Default for Acl {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert(DEFAULT_USER.to_owned(), AclUser::superuser());
        Self { users }
    }
}

impl Acl {
    #[must_use]
    pub fn user(&self, name: &str) -> Option<&AclUser> {
        self.users.get(name)
    }

    /// Create or update a user from `SETUSER` rule tokens.
    ///
    /// # Errors
    /// Returns an error on an unrecognized rule token.
    pub fn set_user(&mut self, name: &str, rules: &[String]) -> Result<(), StoreError> {
        let user = self
            .users
            .entry(name.to_owned())
            .or_insert_with(AclUser::new);
        for rule in rules {
            user.apply_rule(rule)?;
        }
        Ok(())
    }

    /// Remove a user; the `default` user cannot be removed.
    ///
    /// # Errors
    /// Returns an error when asked to remove `default`.
    pub fn del_user(&mut self, name: &str) -> Result<bool, StoreError> {
        if name == DEFAULT_USER {
            return Err(StoreError::DeleteDefaultUser);
        }
        Ok(self.users.remove(name).is_some())
    }

    /// Verify `password` for an enabled user.
    #[must_use]
    pub fn auth(&self, name: &str, password: &str) -> bool {
        self.users
            .get(name)
            .is_some_and(|u| u.enabled && u.check_password(password))
    }
}

/// Glob match supporting `*` (any run) and `?` (any single char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let (mut star, mut mark) = (None, 0);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::{Acl, DEFAULT_USER, glob_match};

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("cached:*", "cached:x"));
        assert!(!glob_match("cached:*", "x"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abcd"));
    }

    #[test]
    fn default_user_is_superuser() {
        let acl = Acl::default();
        let user = acl.user(DEFAULT_USER).expect("default user");
        assert!(user.enabled());
        assert!(user.permits_command("set"));
        assert!(user.permits_key("anything"));
    }

    #[test]
    fn set_user_rules() {
        let mut acl = Acl::default();
        let rules: Vec<String> = ["on", ">pass", "~cached:*", "+get", "+function"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        acl.set_user("alice", &rules).expect("set user");
        let alice = acl.user("alice").expect("alice");
        assert!(alice.permits_command("get"));
        assert!(alice.permits_command("GET"));
        assert!(!alice.permits_command("set"));
        assert!(alice.permits_key("cached:x"));
        assert!(!alice.permits_key("x"));
        assert!(acl.auth("alice", "pass"));
        assert!(!acl.auth("alice", "wrong"));
    }

    #[test]
    fn default_user_cannot_be_removed() {
        let mut acl = Acl::default();
        assert!(acl.del_user(DEFAULT_USER).is_err());
        acl.set_user("bob", &["on".to_owned()]).expect("set user");
        assert!(acl.del_user("bob").expect("del"));
        assert!(!acl.del_user("bob").expect("del"));
    }
}
