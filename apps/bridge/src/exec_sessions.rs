use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    cluster::ExitCode,
    scope::{ContainerName, ExecId, random_segment},
};

const EXEC_SUFFIX_LEN: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Created,
    Running,
    Exited(ExitCode),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecSnapshot {
    pub id: ExecId,
    pub config: ExecConfig,
    pub state: ExecState,
}

impl ExecSnapshot {
    #[must_use]
    pub fn running(&self) -> bool {
        self.state == ExecState::Running
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self.state {
            ExecState::Exited(code) => Some(code),
            ExecState::Created | ExecState::Running => None,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecSessionError {
    #[error("no such exec instance: {0}")]
    NotFound(String),
    #[error("exec instance {0} has already been started")]
    AlreadyStarted(String),
}

struct ExecSession {
    snapshot: ExecSnapshot,
    touched_at: Instant,
}

/// Process-local registry of exec instances.
///
/// Sessions that are not running are evicted once untouched for `ttl`.
pub struct ExecSessionTable {
    sessions: Mutex<HashMap<String, ExecSession>>,
    ttl: Duration,
}

impl ExecSessionTable {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ExecSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, container: &ContainerName, config: ExecConfig) -> ExecId {
        let mut sessions = self.sessions();
        self.evict_expired_locked(&mut sessions);
        let id = loop {
            let candidate = ExecId {
                container: container.clone(),
                exec: random_segment(EXEC_SUFFIX_LEN),
            };
            if !sessions.contains_key(&candidate.to_string()) {
                break candidate;
            }
        };
        sessions.insert(
            id.to_string(),
            ExecSession {
                snapshot: ExecSnapshot {
                    id: id.clone(),
                    config,
                    state: ExecState::Created,
                },
                touched_at: Instant::now(),
            },
        );
        debug!(exec_id = %id, "exec instance created");
        id
    }

    pub fn inspect(&self, id: &ExecId) -> Result<ExecSnapshot, ExecSessionError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&id.to_string())
            .ok_or_else(|| ExecSessionError::NotFound(id.to_string()))?;
        session.touched_at = Instant::now();
        Ok(session.snapshot.clone())
    }

    /// Moves a created session to running. The returned guard records the
    /// outcome; dropping it unfinished records an unknown exit.
    pub fn begin_start(
        self: &Arc<Self>,
        id: &ExecId,
    ) -> Result<(ExecConfig, ExecCompletion), ExecSessionError> {
        let key = id.to_string();
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&key)
            .ok_or_else(|| ExecSessionError::NotFound(key.clone()))?;
        if session.snapshot.state != ExecState::Created {
            return Err(ExecSessionError::AlreadyStarted(key));
        }
        session.snapshot.state = ExecState::Running;
        session.touched_at = Instant::now();
        Ok((
            session.snapshot.config.clone(),
            ExecCompletion {
                table: Arc::clone(self),
                key,
                finished: false,
            },
        ))
    }

    /// Drops expired sessions and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions();
        self.evict_expired_locked(&mut sessions)
    }

    fn evict_expired_locked(&self, sessions: &mut HashMap<String, ExecSession>) -> usize {
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.snapshot.state == ExecState::Running || session.touched_at.elapsed() < self.ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired exec instances");
        }
        evicted
    }

    fn finish(&self, key: &str, code: ExitCode) {
        if let Some(session) = self.sessions().get_mut(key) {
            session.snapshot.state = ExecState::Exited(code);
            session.touched_at = Instant::now();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ExecCompletion {
    table: Arc<ExecSessionTable>,
    key: String,
    finished: bool,
}

impl ExecCompletion {
    pub fn finish(mut self, code: ExitCode) {
        self.finished = true;
        self.table.finish(&self.key, code);
    }
}

impl Drop for ExecCompletion {
    fn drop(&mut self) {
        if !self.finished {
            self.table.finish(&self.key, ExitCode::Unknown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{ExecConfig, ExecSessionError, ExecSessionTable, ExecState};
    use crate::{
        cluster::ExitCode,
        scope::{ContainerName, ExecId},
    };

    fn container() -> ContainerName {
        ContainerName::parse("build.runner-1.levias-abcd1234").expect("valid name")
    }

    fn config() -> ExecConfig {
        ExecConfig {
            cmd: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
            attach_stdout: true,
            ..ExecConfig::default()
        }
    }

    #[test]
    fn inspect_before_create_is_not_found() {
        let table = ExecSessionTable::new(Duration::from_secs(60));
        let id = ExecId::parse("build.runner-1.levias-abcd1234.x7k2m9qp").expect("id");
        assert!(matches!(
            table.inspect(&id),
            Err(ExecSessionError::NotFound(_))
        ));
    }

    #[test]
    fn created_session_is_idle_without_exit_code() {
        let table = ExecSessionTable::new(Duration::from_secs(60));
        let id = table.create(&container(), config());
        assert_eq!(id.container, container());
        assert_eq!(id.to_string().split('.').count(), 4);
        let snapshot = table.inspect(&id).expect("session");
        assert!(!snapshot.running());
        assert_eq!(snapshot.exit_code(), None);
        assert_eq!(snapshot.config, config());
    }

    #[test]
    fn ids_are_unique_per_create() {
        let table = ExecSessionTable::new(Duration::from_secs(60));
        let first = table.create(&container(), config());
        let second = table.create(&container(), config());
        assert_ne!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn start_is_at_most_once() {
        let table = Arc::new(ExecSessionTable::new(Duration::from_secs(60)));
        let id = table.create(&container(), config());
        let (started_config, completion) = table.begin_start(&id).expect("first start");
        assert_eq!(started_config, config());
        assert!(table.inspect(&id).expect("session").running());
        assert!(matches!(
            table.begin_start(&id),
            Err(ExecSessionError::AlreadyStarted(_))
        ));

        completion.finish(ExitCode::Code(1));
        let snapshot = table.inspect(&id).expect("session");
        assert!(!snapshot.running());
        assert_eq!(snapshot.exit_code(), Some(ExitCode::Code(1)));
        assert!(matches!(
            table.begin_start(&id),
            Err(ExecSessionError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn abandoned_start_records_unknown_exit() {
        let table = Arc::new(ExecSessionTable::new(Duration::from_secs(60)));
        let id = table.create(&container(), config());
        let (_, completion) = table.begin_start(&id).expect("start");
        drop(completion);
        assert_eq!(
            table.inspect(&id).expect("session").state,
            ExecState::Exited(ExitCode::Unknown)
        );
    }

    #[test]
    fn idle_sessions_expire_but_running_ones_stay() {
        let table = Arc::new(ExecSessionTable::new(Duration::ZERO));
        let running = table.create(&container(), config());
        let (_, completion) = table.begin_start(&running).expect("start");
        let idle = table.create(&container(), config());

        assert_eq!(table.evict_expired(), 1);
        assert!(table.inspect(&idle).is_err());
        assert!(table.inspect(&running).expect("running session").running());

        completion.finish(ExitCode::Code(0));
        assert_eq!(table.evict_expired(), 1);
        assert!(table.is_empty());
    }
}
