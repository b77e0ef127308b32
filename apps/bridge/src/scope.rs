//! Scoping of engine-API names to the caller's pod.
//!
//! Every container id handed out by the bridge has the form
//! `namespace.pod.container`, and every exec id appends one more segment.
//! Callers may use the short container name; it is expanded with the
//! namespace and pod taken from their verified identity before any backend
//! call sees it.

use std::fmt;

use rand::Rng;

use crate::identity::Identity;

const SEPARATOR: char = '.';

/// Vowel-free alphabet for generated names.
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Random name segment drawn from [`NAME_ALPHABET`].
#[must_use]
pub fn random_segment(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())]))
        .collect()
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("identity has no namespace claim")]
    MissingNamespace,
    #[error("identity is not bound to a pod")]
    MissingPod,
    #[error("malformed name {name:?}: expected {expected} dot-separated segments")]
    MalformedName { name: String, expected: usize },
    #[error("name {name:?} is outside the caller's pod")]
    OutOfScope { name: String },
}

impl ScopeError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingNamespace => "missing_namespace",
            Self::MissingPod => "missing_pod",
            Self::MalformedName { .. } => "malformed_name",
            Self::OutOfScope { .. } => "out_of_scope",
        }
    }
}

/// The one pod an identity may drive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodScope {
    pub namespace: String,
    pub pod: String,
}

impl PodScope {
    pub fn resolve(identity: &Identity) -> Result<Self, ScopeError> {
        let namespace = identity.namespace().ok_or(ScopeError::MissingNamespace)?;
        let pod = identity.pod_name().ok_or(ScopeError::MissingPod)?;
        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        })
    }

    /// Prefixes short names with `namespace.pod.`; names that already carry
    /// three or more segments pass through untouched.
    #[must_use]
    pub fn rewrite(&self, raw: &str) -> String {
        if raw.split(SEPARATOR).count() >= 3 {
            raw.to_string()
        } else {
            format!("{}{SEPARATOR}{}{SEPARATOR}{raw}", self.namespace, self.pod)
        }
    }

    /// Rewrites, validates and authorizes a container name.
    pub fn container(&self, raw: &str) -> Result<ContainerName, ScopeError> {
        let name = ContainerName::parse(&self.rewrite(raw))?;
        self.authorize(&name)?;
        Ok(name)
    }

    /// Rewrites, validates and authorizes an exec id.
    pub fn exec(&self, raw: &str) -> Result<ExecId, ScopeError> {
        let id = ExecId::parse(&self.rewrite(raw))?;
        self.authorize(&id.container)?;
        Ok(id)
    }

    /// Names a container this scope owns.
    #[must_use]
    pub fn name(&self, container: &str) -> ContainerName {
        ContainerName {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            container: container.to_string(),
        }
    }

    fn authorize(&self, name: &ContainerName) -> Result<(), ScopeError> {
        if name.namespace == self.namespace && name.pod == self.pod {
            Ok(())
        } else {
            Err(ScopeError::OutOfScope {
                name: name.to_string(),
            })
        }
    }
}

/// A fully scoped `namespace.pod.container` name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerName {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerName {
    pub fn parse(raw: &str) -> Result<Self, ScopeError> {
        let [namespace, pod, container] = split_exact::<3>(raw)?;
        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        })
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.namespace, self.pod, self.container
        )
    }
}

/// A `namespace.pod.container.exec` id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecId {
    pub container: ContainerName,
    pub exec: String,
}

impl ExecId {
    pub fn parse(raw: &str) -> Result<Self, ScopeError> {
        let [namespace, pod, container, exec] = split_exact::<4>(raw)?;
        Ok(Self {
            container: ContainerName {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                container: container.to_string(),
            },
            exec: exec.to_string(),
        })
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.container, self.exec)
    }
}

fn split_exact<const N: usize>(raw: &str) -> Result<[&str; N], ScopeError> {
    let malformed = || ScopeError::MalformedName {
        name: raw.to_string(),
        expected: N,
    };
    let segments: Vec<&str> = raw.split(SEPARATOR).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(malformed());
    }
    segments.try_into().map_err(|_| malformed())
}
