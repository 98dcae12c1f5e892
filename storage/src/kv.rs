use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use consensus::{Command, StateMachine};

use crate::{Result, StorageError};

/// A parsed store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set { key: String, value: String },
    Get { key: String },
    Del { key: String },
}

impl Operation {
    pub fn parse(command: &[String]) -> Result<Self> {
        let (verb, args) = command
            .split_first()
            .ok_or_else(|| StorageError::UnknownCommand(String::new()))?;

        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(StorageError::InvalidArguments {
                    command: verb.clone(),
                    expected,
                    got: args.len(),
                })
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "set" => {
                arity(2)?;
                Ok(Operation::Set {
                    key: args[0].clone(),
                    value: args[1].clone(),
                })
            }
            "get" => {
                arity(1)?;
                Ok(Operation::Get { key: args[0].clone() })
            }
            "del" => {
                arity(1)?;
                Ok(Operation::Del { key: args[0].clone() })
            }
            _ => Err(StorageError::UnknownCommand(verb.clone())),
        }
    }
}

/// A stored value and the number of writes it has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub value: String,
    pub version: u64,
}

/// In-memory variable store the replicated log is applied to.
///
/// Every command yields a result string: the value written for `set`, the
/// current value for `get`, the removed value for `del`. Missing keys
/// yield an empty string.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore {
    vars: BTreeMap<String, Variable>,
    applied: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(&mut self, operation: Operation) -> String {
        match operation {
            Operation::Set { key, value } => {
                let version = self.vars.get(&key).map_or(1, |v| v.version + 1);
                self.vars.insert(
                    key,
                    Variable {
                        value: value.clone(),
                        version,
                    },
                );
                value
            }
            Operation::Get { key } => self.get(&key).unwrap_or_default().to_string(),
            Operation::Del { key } => self.vars.remove(&key).map(|v| v.value).unwrap_or_default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.value.as_str())
    }

    pub fn variable(&self, key: &str) -> Option<&Variable> {
        self.vars.get(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Number of commands applied, including rejected ones.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &Command) -> String {
        self.applied += 1;
        match Operation::parse(command) {
            Ok(operation) => self.execute(operation),
            Err(e) => {
                tracing::warn!("Rejected command {:?}: {}", command, e);
                format!("error: {}", e)
            }
        }
    }
}
