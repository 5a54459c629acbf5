//! Access control: who may write into which `database.table`.

use std::collections::HashSet;

use crate::config::AccessConfig;
use crate::error::{Result, TabloadError};

/// Identity behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    /// Sees every upload and may process files uploaded by others
    pub privileged: bool,
}

impl Caller {
    pub fn new(user: impl Into<String>, privileged: bool) -> Self {
        Self {
            user: user.into(),
            privileged,
        }
    }

    /// Whether this caller may act on something owned by `owner`
    pub fn can_act_for(&self, owner: &str) -> bool {
        self.privileged || self.user == owner
    }
}

pub trait AccessControl: Send + Sync {
    /// `AccessDenied` unless `caller` may write into `database.table`
    fn authorize(&self, caller: &Caller, database: &str, table: &str) -> Result<()>;

    fn is_privileged(&self, user: &str) -> bool;

    fn caller(&self, user: &str) -> Caller {
        Caller::new(user, self.is_privileged(user))
    }
}

/// Allow-list of `database.table` patterns from the config file
///
/// `*` stands for a whole segment (`main.*`, `*.users`, `*`). An empty list
/// allows every table.
#[derive(Debug, Clone, Default)]
pub struct TableAllowList {
    patterns: Vec<(String, String)>,
    privileged: HashSet<String>,
}

impl TableAllowList {
    pub fn from_config(config: &AccessConfig) -> Self {
        let patterns = config
            .allowed_tables
            .iter()
            .map(|p| {
                let p = p.trim().to_lowercase();
                match p.split_once('.') {
                    Some((db, table)) => (db.to_string(), table.to_string()),
                    None if p == "*" => ("*".to_string(), "*".to_string()),
                    None => ("*".to_string(), p),
                }
            })
            .collect();

        Self {
            patterns,
            privileged: config.privileged_users.iter().cloned().collect(),
        }
    }

    fn allows(&self, database: &str, table: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let database = database.to_lowercase();
        let table = table.to_lowercase();
        self.patterns.iter().any(|(db, tb)| {
            (db == "*" || *db == database) && (tb == "*" || *tb == table)
        })
    }
}

impl AccessControl for TableAllowList {
    fn authorize(&self, caller: &Caller, database: &str, table: &str) -> Result<()> {
        if caller.user.trim().is_empty() {
            return Err(TabloadError::AccessDenied("anonymous caller".to_string()));
        }
        if caller.privileged || self.allows(database, table) {
            return Ok(());
        }
        log::warn!("Denied {} write access to {}.{}", caller.user, database, table);
        Err(TabloadError::AccessDenied(format!(
            "{} may not write to {}.{}",
            caller.user, database, table
        )))
    }

    fn is_privileged(&self, user: &str) -> bool {
        self.privileged.contains(user)
    }
}
