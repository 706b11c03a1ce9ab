//! # Client
//!
//! The [`Client`] holds the resolved options, the registry of declared test
//! cases and the connection to the server. It is a cheap handle: clones share
//! the same state, so one client can be passed to every workflow and thread.
//!
//! ## Active test case
//!
//! Results are always captured into the *active* test case of the caller.
//! With `concurrency` enabled (the default) every execution context has its
//! own active test case: a task running inside [`scoped`] is one context, and
//! outside of such a scope every thread is one. With `concurrency` disabled
//! all contexts share a single active test case, so declaring a test case from
//! any thread redirects the captures of every other thread as well.
//!
//! ```rust,ignore
//! let client = touca::Client::new();
//! client.configure(Options { offline: Some(true), ..Default::default() }).await?;
//! client.declare_testcase("alice");
//! client.check("gpa", 3.9)?;
//! client.save("alice.json", None, true, SaveFormat::Json)?;
//! ```

use indexmap::IndexMap;
use serde::Serialize;
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    thread::ThreadId,
};
use tracing::*;

use crate::{
    case::{Case, ComparisonRule, Metadata},
    container,
    options::{self, Mode, Options, ResolveContext},
    transport::{ComparisonOverview, Transport},
    value::{ToTypedValue, TypeRegistry, TypedValue},
    ConfigError, Error, Result,
};

tokio::task_local! {
    static SCOPE: u64;
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Run `future` as its own execution context. The active test case declared
/// inside follows the task even when it moves between worker threads.
pub async fn scoped<F: Future>(future: F) -> F::Output {
    let id = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
    SCOPE.scope(id, future).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ContextKey {
    Thread(ThreadId),
    Task(u64),
}

fn current_context() -> ContextKey {
    SCOPE
        .try_with(|id| ContextKey::Task(*id))
        .unwrap_or_else(|_| ContextKey::Thread(std::thread::current().id()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    Binary,
    Json,
}

/// Options that determine which server, and which version of which suite,
/// the transport talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    api_key: Option<String>,
    api_url: Option<String>,
    team: Option<String>,
    suite: Option<String>,
    version: Option<String>,
}

impl From<&Options> for Identity {
    fn from(options: &Options) -> Identity {
        Identity {
            api_key: options.api_key.clone(),
            api_url: options.api_url.clone(),
            team: options.team.clone(),
            suite: options.suite.clone(),
            version: options.version.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Options as given to `configure`, accumulated over all calls.
    raw: Options,
    options: Options,
    configured: bool,
    cases: IndexMap<String, Case>,
    shared_active: Option<String>,
    active: HashMap<ContextKey, String>,
    transport: Option<(Identity, Transport)>,
}

impl State {
    fn per_context(&self) -> bool {
        self.options.concurrency.unwrap_or(true)
    }

    fn active_name(&self) -> Option<&String> {
        if self.per_context() {
            self.active.get(&current_context())
        } else {
            self.shared_active.as_ref()
        }
    }

    fn active_case(&mut self) -> Result<&mut Case> {
        let name = self.active_name().cloned().ok_or(Error::NoActiveCase)?;
        self.cases.get_mut(&name).ok_or(Error::NoActiveCase)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    registry: RwLock<TypeRegistry>,
    context: ResolveContext,
}

#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    /// Construct a client that reads environment variables and profiles of the
    /// current process when configured.
    pub fn new() -> Client {
        Client::with_context(ResolveContext::from_process())
    }

    pub fn with_context(context: ResolveContext) -> Client {
        Client {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                registry: RwLock::new(TypeRegistry::new()),
                context,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `incoming` into the options given in previous calls and resolve
    /// them. On error the previous configuration stays in effect.
    pub async fn configure(&self, incoming: Options) -> Result<()> {
        let (raw, existing) = {
            let state = self.lock();
            (state.raw.clone().merge(&incoming), state.transport.clone())
        };

        let options = options::resolve_local(&raw, Mode::Core, &self.inner.context)?;
        let identity = Identity::from(&options);
        let (options, transport) = match existing {
            Some((current, transport)) if current == identity && !options.is_offline() => {
                (options, Some(transport))
            }
            _ => options::authenticate(options, Mode::Core).await?,
        };
        options::validate(&options, Mode::Core)?;

        let mut state = self.lock();
        state.raw = raw;
        state.options = options;
        state.configured = true;
        state.transport = transport.map(|transport| (identity, transport));
        debug!("client configured");
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.lock().configured
    }

    /// Resolved options.
    pub fn options(&self) -> Options {
        self.lock().options.clone()
    }

    /// Register a converter used by [`Client::transform`] for values of type `T`.
    pub fn add_serializer<T, F>(&self, converter: F)
    where
        T: Any,
        F: Fn(&T) -> TypedValue + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(converter);
    }

    pub fn transform<T: Serialize + Any>(&self, value: &T) -> Result<TypedValue> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transform(value)
    }

    /// Create the test case if needed and make it the active one.
    pub fn declare_testcase(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.lock();
        if !state.cases.contains_key(&name) {
            let options = &state.options;
            let metadata = Metadata {
                team: options.team.clone().unwrap_or_else(|| "unknown".into()),
                suite: options.suite.clone().unwrap_or_else(|| "unknown".into()),
                version: options.version.clone().unwrap_or_else(|| "unknown".into()),
                testcase: name.clone(),
            };
            state.cases.insert(name.clone(), Case::new(metadata));
        }
        if state.per_context() {
            state.active.insert(current_context(), name);
        } else {
            state.shared_active = Some(name);
        }
    }

    /// Remove the test case and everything captured for it.
    pub fn forget_testcase(&self, name: &str) {
        let mut state = self.lock();
        state.cases.shift_remove(name);
        state.active.retain(|_, active| active != name);
        if state.shared_active.as_deref() == Some(name) {
            state.shared_active = None;
        }
    }

    /// Names of the declared test cases, in declaration order.
    pub fn testcases(&self) -> Vec<String> {
        self.lock().cases.keys().cloned().collect()
    }

    /// Copy of a declared test case.
    pub fn snapshot(&self, name: &str) -> Option<Case> {
        self.lock().cases.get(name).cloned()
    }

    /// Whether the test case holds any result or metric.
    pub fn has_captured(&self, name: &str) -> bool {
        self.lock()
            .cases
            .get(name)
            .is_some_and(|case| !case.is_empty())
    }

    fn with_active_case<T>(&self, f: impl FnOnce(&mut Case) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        f(state.active_case()?)
    }

    pub fn check(&self, key: impl Into<String>, value: impl ToTypedValue) -> Result<()> {
        let value = value.to_typed_value();
        self.with_active_case(|case| {
            case.check(key, value, None);
            Ok(())
        })
    }

    pub fn check_with_rule(
        &self,
        key: impl Into<String>,
        value: impl ToTypedValue,
        rule: ComparisonRule,
    ) -> Result<()> {
        let value = value.to_typed_value();
        self.with_active_case(|case| {
            case.check(key, value, Some(rule));
            Ok(())
        })
    }

    pub fn add_result(&self, key: impl Into<String>, value: impl ToTypedValue) -> Result<()> {
        self.check(key, value)
    }

    pub fn assume(&self, key: impl Into<String>, value: impl ToTypedValue) -> Result<()> {
        let value = value.to_typed_value();
        self.with_active_case(|case| {
            case.assume(key, value);
            Ok(())
        })
    }

    pub fn add_assertion(&self, key: impl Into<String>, value: impl ToTypedValue) -> Result<()> {
        self.assume(key, value)
    }

    pub fn check_file(&self, key: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        self.with_active_case(|case| case.check_file(key, path))
    }

    pub fn add_array_element(&self, key: impl Into<String>, value: impl ToTypedValue) -> Result<()> {
        let value = value.to_typed_value();
        self.with_active_case(|case| case.add_array_element(key, value))
    }

    pub fn add_hit_count(&self, key: impl Into<String>) -> Result<()> {
        self.with_active_case(|case| case.add_hit_count(key))
    }

    pub fn add_metric(&self, key: impl Into<String>, milliseconds: i64) -> Result<()> {
        self.with_active_case(|case| {
            case.add_metric(key, milliseconds);
            Ok(())
        })
    }

    pub fn start_timer(&self, key: impl Into<String>) -> Result<()> {
        self.with_active_case(|case| {
            case.start_timer(key);
            Ok(())
        })
    }

    pub fn stop_timer(&self, key: &str) -> Result<()> {
        self.with_active_case(|case| {
            case.stop_timer(key);
            Ok(())
        })
    }

    /// Start a timer that stops when the returned guard is dropped.
    pub fn scoped_timer(&self, key: impl Into<String>) -> Result<ScopedTimer> {
        let key = key.into();
        self.start_timer(key.clone())?;
        Ok(ScopedTimer {
            client: self.clone(),
            key,
        })
    }

    /// Write the given test cases, or all of them, to `path`. An existing file
    /// is kept unless `overwrite` is set.
    pub fn save(
        &self,
        path: impl AsRef<Path>,
        testcases: Option<&[String]>,
        overwrite: bool,
        format: SaveFormat,
    ) -> Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            debug!("keeping existing file {path:?}");
            return Ok(());
        }

        let state = self.lock();
        let selected: Vec<&Case> = match testcases {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let case = state.cases.get(name);
                    if case.is_none() {
                        warn!("test case \"{name}\" is not declared");
                    }
                    case
                })
                .collect(),
            None => state.cases.values().collect(),
        };
        let content = match format {
            SaveFormat::Binary => container::encode(selected.iter().map(|case| case.serialize())),
            SaveFormat::Json => {
                let documents: Vec<_> = selected.iter().map(|case| case.json()).collect();
                serde_json::to_vec_pretty(&documents)
                    .map_err(|e| Error::UnsupportedType(e.to_string()))?
            }
        };
        drop(state);

        std::fs::write(path, content)?;
        debug!("saved results to {path:?}");
        Ok(())
    }

    fn transport(&self) -> Result<(Transport, Options)> {
        let state = self.lock();
        let (_, transport) = state.transport.as_ref().ok_or(Error::ClientNotConfigured)?;
        Ok((transport.clone(), state.options.clone()))
    }

    /// Test cases of the baseline version of the configured suite.
    pub async fn get_testcases(&self) -> Result<Vec<String>> {
        let (transport, options) = self.transport()?;
        if let Some(testcases) = options.testcases {
            return Ok(testcases);
        }
        let team = options.team.ok_or(ConfigError::MissingOption("team"))?;
        let suite = options.suite.ok_or(ConfigError::MissingOption("suite"))?;
        transport.get_testcases(&team, &suite).await
    }

    /// Submit every declared test case.
    pub async fn post(&self) -> Result<Vec<ComparisonOverview>> {
        let (transport, options) = self.transport()?;
        let content = {
            let state = self.lock();
            container::encode(state.cases.values().map(Case::serialize))
        };
        transport
            .post_results(content, options.submission_mode.unwrap_or_default())
            .await
    }

    /// Tell the server that no more results will be submitted for the
    /// configured version.
    pub async fn seal(&self) -> Result<()> {
        let (transport, options) = self.transport()?;
        let team = options.team.ok_or(ConfigError::MissingOption("team"))?;
        let suite = options.suite.ok_or(ConfigError::MissingOption("suite"))?;
        let version = options.version.ok_or(ConfigError::MissingOption("version"))?;
        transport.seal(&team, &suite, &version).await
    }
}

/// Timer guard returned by [`Client::scoped_timer`].
#[must_use = "the timer stops as soon as the guard is dropped"]
pub struct ScopedTimer {
    client: Client,
    key: String,
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if let Err(e) = self.client.stop_timer(&self.key) {
            debug!("failed to stop timer \"{}\": {e}", self.key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{thread, time::Duration};

    async fn offline_client(concurrency: bool) -> eyre::Result<Client> {
        let client = Client::with_context(ResolveContext::default());
        client
            .configure(Options {
                team: Some("acme".into()),
                suite: Some("students".into()),
                version: Some("v1.0".into()),
                concurrency: Some(concurrency),
                ..Default::default()
            })
            .await?;
        Ok(client)
    }

    fn value_of(client: &Client, testcase: &str, key: &str) -> Option<TypedValue> {
        client
            .snapshot(testcase)?
            .get(key)
            .map(|entry| entry.value.clone())
    }

    #[test]
    fn capture_without_active_case_fails() {
        let client = Client::with_context(ResolveContext::default());
        let err = client.check("k", 1i64).unwrap_err();
        assert!(matches!(err, Error::NoActiveCase), "{err}");
    }

    #[tokio::test]
    async fn configure_is_cumulative() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        client
            .configure(Options {
                version: Some("v2.0".into()),
                ..Default::default()
            })
            .await?;
        let options = client.options();
        assert!(client.is_configured());
        assert_eq!(options.team.as_deref(), Some("acme"));
        assert_eq!(options.version.as_deref(), Some("v2.0"));
        assert_eq!(options.offline, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn failed_configure_keeps_previous_state() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        let err = client
            .configure(Options {
                offline: Some(false),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Config(ConfigError::MissingOption("api_key"))),
            "{err}"
        );
        assert_eq!(client.options().offline, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn declared_case_carries_metadata() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        client.declare_testcase("alice");
        client.declare_testcase("alice");
        client.check("gpa", 3.9)?;
        client.add_hit_count("visits")?;
        client.add_hit_count("visits")?;

        assert_eq!(client.testcases(), vec!["alice".to_string()]);
        let case = client.snapshot("alice").unwrap();
        assert_eq!(case.metadata().team, "acme");
        assert_eq!(case.metadata().testcase, "alice");
        assert_eq!(value_of(&client, "alice", "visits"), Some(TypedValue::Int(2)));
        Ok(())
    }

    #[tokio::test]
    async fn forget_releases_the_case() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        client.declare_testcase("alice");
        client.check("k", true)?;
        client.forget_testcase("alice");
        assert!(client.snapshot("alice").is_none());
        let err = client.check("k", true).unwrap_err();
        assert!(matches!(err, Error::NoActiveCase), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn threads_own_their_active_case() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        thread::scope(|s| {
            for name in ["alice", "bob", "carol"] {
                let client = client.clone();
                s.spawn(move || {
                    client.declare_testcase(name);
                    for _ in 0..50 {
                        client.add_array_element("owner", name).unwrap();
                        thread::yield_now();
                    }
                });
            }
        });
        for name in ["alice", "bob", "carol"] {
            let Some(TypedValue::Array(items)) = value_of(&client, name, "owner") else {
                eyre::bail!("missing array for {name}");
            };
            assert_eq!(items.len(), 50);
            assert!(items.iter().all(|item| item == &TypedValue::String(name.into())));
        }
        Ok(())
    }

    #[tokio::test]
    async fn shared_mode_redirects_every_thread() -> eyre::Result<()> {
        let client = offline_client(false).await?;
        client.declare_testcase("alice");
        client.check("before", 1i64)?;

        let other = client.clone();
        thread::spawn(move || other.declare_testcase("bob"))
            .join()
            .expect("declaring thread panicked");

        client.check("after", 2i64)?;
        assert_eq!(value_of(&client, "alice", "before"), Some(TypedValue::Int(1)));
        assert_eq!(value_of(&client, "alice", "after"), None);
        assert_eq!(value_of(&client, "bob", "after"), Some(TypedValue::Int(2)));
        Ok(())
    }

    #[tokio::test]
    async fn scoped_tasks_own_their_active_case() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        let tasks: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                let client = client.clone();
                tokio::spawn(scoped(async move {
                    client.declare_testcase(name);
                    tokio::task::yield_now().await;
                    client.check("name", name)
                }))
            })
            .collect();
        for task in tasks {
            task.await??;
        }
        assert_eq!(
            value_of(&client, "alice", "name"),
            Some(TypedValue::String("alice".into()))
        );
        assert_eq!(
            value_of(&client, "bob", "name"),
            Some(TypedValue::String("bob".into()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn scoped_timer_records_metric() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        client.declare_testcase("alice");
        {
            let _timer = client.scoped_timer("load")?;
            thread::sleep(Duration::from_millis(12));
        }
        client.stop_timer("never-started")?;
        let metrics = client.snapshot("alice").unwrap().metrics();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].1 >= 10, "{metrics:?}");
        Ok(())
    }

    #[tokio::test]
    async fn registered_serializer_is_used() -> eyre::Result<()> {
        #[derive(Serialize)]
        struct Course {
            name: String,
            grade: f64,
        }

        let client = offline_client(true).await?;
        client.add_serializer(|c: &Course| TypedValue::String(format!("{}:{}", c.name, c.grade)));
        client.declare_testcase("alice");
        let course = Course {
            name: "math".into(),
            grade: 4.0,
        };
        client.check("course", client.transform(&course)?)?;
        assert_eq!(
            value_of(&client, "alice", "course"),
            Some(TypedValue::String("math:4".into()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn save_respects_overwrite() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        client.declare_testcase("alice");
        client.check("gpa", 3.9)?;
        client.declare_testcase("bob");
        client.check("gpa", 3.1)?;

        let dir = tempfile::tempdir()?;
        let json_path = dir.path().join("results.json");
        client.save(&json_path, Some(&["bob".to_string()][..]), false, SaveFormat::Json)?;
        let documents: serde_json::Value = serde_json::from_slice(&std::fs::read(&json_path)?)?;
        assert_eq!(documents.as_array().map(Vec::len), Some(1));
        assert_eq!(documents[0]["metadata"]["testcase"], "bob");

        client.save(&json_path, None, false, SaveFormat::Json)?;
        let documents: serde_json::Value = serde_json::from_slice(&std::fs::read(&json_path)?)?;
        assert_eq!(documents.as_array().map(Vec::len), Some(1));

        let bin_path = dir.path().join("results.bin");
        client.save(&bin_path, None, true, SaveFormat::Binary)?;
        let decoded = container::decode(&std::fs::read(&bin_path)?)?;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].metadata.testcase, "alice");
        Ok(())
    }

    #[tokio::test]
    async fn remote_operations_require_transport() -> eyre::Result<()> {
        let client = offline_client(true).await?;
        assert!(matches!(
            client.get_testcases().await,
            Err(Error::ClientNotConfigured)
        ));
        assert!(matches!(client.post().await, Err(Error::ClientNotConfigured)));
        assert!(matches!(client.seal().await, Err(Error::ClientNotConfigured)));
        Ok(())
    }

    #[tokio::test]
    async fn post_and_seal() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let verify = server
            .mock("POST", "/client/verify")
            .match_header("X-Touca-API-Key", "key")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let submit = server
            .mock("POST", "/client/submit")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let seal = server
            .mock("POST", "/batch/acme/students/v1.0/seal2")
            .with_status(204)
            .expect(2)
            .create_async()
            .await;

        let client = Client::with_context(ResolveContext::default());
        client
            .configure(Options {
                api_key: Some("key".into()),
                api_url: Some(format!("{}/@/acme/students/v1.0", server.url())),
                testcases: Some(vec!["alice".into()]),
                ..Default::default()
            })
            .await?;
        client
            .configure(Options {
                concurrency: Some(false),
                ..Default::default()
            })
            .await?;

        client.declare_testcase("alice");
        client.check("gpa", 3.9)?;
        assert!(client.post().await?.is_empty());
        client.seal().await?;
        client.seal().await?;
        assert_eq!(client.get_testcases().await?, vec!["alice".to_string()]);

        verify.assert_async().await;
        submit.assert_async().await;
        seal.assert_async().await;
        Ok(())
    }
}
