//! Script orchestrator: owns both engines and every cache
//!
//! `initialize` builds a [`Runtime`] (dynamic engine, optional native engine
//! with its bridge, projector and chain cache). `reset_for_reload` drops it
//! wholesale; the next `initialize` starts from scratch.

use crate::bridge::{workspace_value, NativeBridge};
use crate::chain::HandlerChains;
use crate::coercion::{bind_arguments, Coerced, EnumRegistry};
use crate::context::{PostResponseContext, PreRequestContext};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::engine::{HostValue, ScriptEngine};
use crate::error::{Result, ScriptError};
use crate::lua_engine::LuaEngine;
use crate::projector::{ExecutorSlot, LazyProjector, RequestExecutor};
use crate::rhai_engine::RhaiEngine;
use courier_config::ScriptingSettings;
use courier_core::{Ancestry, ScriptLanguage, ScriptingConfig};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Log an orchestration step at `debug` when step tracing is on, else `trace`
macro_rules! step {
    ($settings:expr, $($arg:tt)+) => {
        if $settings.trace_steps {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

/// Everything built by `initialize`
#[derive(Debug)]
struct Runtime {
    dynamic: Arc<LuaEngine>,
    native: Option<Arc<RhaiEngine>>,
    bridge: Option<Arc<NativeBridge>>,
    projector: LazyProjector,
    chains: HandlerChains,
}

/// Outcome of a best-effort warmup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Namespaces created or found
    pub namespaces: usize,
    /// Scripts compiled by this warmup
    pub compiled: usize,
    /// Workspace chain levels built
    pub chains: usize,
    /// Entries that failed (each recorded as a diagnostic)
    pub failed: usize,
}

/// Orchestrates both engines over one configuration
#[derive(Debug)]
pub struct ScriptOrchestrator {
    config: Arc<ScriptingConfig>,
    settings: ScriptingSettings,
    diagnostics: Diagnostics,
    executor: Arc<ExecutorSlot>,
    enums: RwLock<EnumRegistry>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    init_lock: Mutex<()>,
}

impl ScriptOrchestrator {
    /// Create an orchestrator; nothing runs until [`initialize`](Self::initialize)
    pub fn new(config: Arc<ScriptingConfig>, settings: ScriptingSettings) -> Self {
        Self {
            config,
            settings,
            diagnostics: Diagnostics::new(),
            executor: Arc::new(ExecutorSlot::new()),
            enums: RwLock::new(EnumRegistry::default()),
            runtime: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    /// Configuration being orchestrated
    pub fn config(&self) -> &Arc<ScriptingConfig> {
        &self.config
    }

    /// Active settings
    pub fn settings(&self) -> &ScriptingSettings {
        &self.settings
    }

    /// Start both engines, project the configuration and run global init
    ///
    /// Repeat calls are no-ops. The active workspace, if any, is activated.
    /// Must not be called from a script body or a request executor; it would
    /// wait on itself.
    pub fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock();
        if self.runtime.read().is_some() {
            return Ok(());
        }
        info!(workspaces = self.config.workspaces.len(), "Initializing script orchestrator");

        step!(self.settings, "Starting dynamic engine");
        let dynamic = Arc::new(LuaEngine::new());
        dynamic.initialize_environment()?;

        let active_chain = self.active_chain();
        let needs_native =
            self.settings.force_native || self.config.targets(ScriptLanguage::Rhai, active_chain.as_ref());
        let (native, bridge) = if needs_native {
            step!(self.settings, forced = self.settings.force_native, "Starting native engine");
            let native = Arc::new(RhaiEngine::with_settings(&self.settings));
            native.initialize_environment()?;
            let bridge = Arc::new(
                NativeBridge::new(Arc::clone(&native), Arc::clone(&self.config))
                    .with_enums(self.enums.read().clone()),
            );
            dynamic.with_lua(|lua| bridge.install(lua))?;
            (Some(native), Some(bridge))
        } else {
            debug!("No body targets the native engine; skipping it");
            (None, None)
        };

        step!(self.settings, "Projecting workspaces");
        let projector = LazyProjector::new(
            Arc::clone(&self.config),
            &self.settings,
            self.diagnostics.clone(),
            Arc::clone(&self.executor),
            bridge.clone(),
        );
        dynamic.with_lua(|lua| projector.install(lua))?;

        step!(self.settings, "Running global init");
        if let Some(native) = &native {
            native
                .run_init_body(&self.config.init)
                .map_err(|e| e.with_context("global init"))?;
        }
        dynamic
            .run_init_body(&self.config.init)
            .map_err(|e| e.with_context("global init"))?;

        let chains = HandlerChains::new(
            Arc::clone(&self.config),
            self.diagnostics.clone(),
            projector.clone(),
            native.clone(),
        );
        *self.runtime.write() = Some(Arc::new(Runtime {
            dynamic,
            native,
            bridge,
            projector,
            chains,
        }));

        if let Some(active) = &self.config.active_workspace {
            if self.config.workspace(active).is_some() {
                self.activate_workspace(active)?;
            } else {
                warn!(workspace = %active, "Active workspace is not defined");
            }
        }

        info!(native = self.native_enabled(), "Script orchestrator initialized");
        Ok(())
    }

    /// Whether `initialize` has completed since construction or the last reset
    pub fn is_initialized(&self) -> bool {
        self.runtime.read().is_some()
    }

    /// Whether the native engine is running
    pub fn native_enabled(&self) -> bool {
        self.runtime
            .read()
            .as_ref()
            .map_or(false, |runtime| runtime.native.is_some())
    }

    /// Tear down both engines and every cache; `initialize` must follow
    ///
    /// The registered request executor and enumerations are kept. Must not be
    /// called from a script body or a request executor.
    pub fn reset_for_reload(&self) {
        let _guard = self.init_lock.lock();
        let previous = self.runtime.write().take();
        self.diagnostics.clear();
        info!(was_initialized = previous.is_some(), "Script orchestrator reset for reload");
    }

    /// Project `name`, run its init chain and build its handlers
    ///
    /// Safe to repeat; init bodies run once per workspace.
    pub fn activate_workspace(&self, name: &str) -> Result<()> {
        let runtime = self.runtime()?;
        if self.config.workspace(name).is_none() {
            return Err(ScriptError::WorkspaceNotFound(name.to_string()));
        }
        step!(self.settings, workspace = name, "Activating workspace");

        runtime.dynamic.with_lua(|lua| -> Result<()> {
            let namespace = runtime.projector.namespace(lua, name)?;
            let initialized = runtime.chains.initialize_workspace(lua, name)?;
            runtime.chains.workspace_level(lua, name)?;
            if let Some(namespace) = namespace {
                lua.globals().set("workspace", namespace)?;
            }
            if !initialized.is_empty() {
                debug!(workspace = name, chain = ?initialized, "Init chain ran");
            }
            Ok(())
        })?;

        if let Some(native) = &runtime.native {
            native.set_global("workspace", workspace_value(&self.config, Some(name)))?;
        }
        Ok(())
    }

    /// Install the callback request shims forward to, replacing any previous one
    pub fn register_request_executor<F>(&self, executor: F)
    where
        F: Fn(&str, &str, Vec<HostValue>) -> Result<HostValue> + Send + Sync + 'static,
    {
        let executor: RequestExecutor = Arc::new(executor);
        self.executor.set(executor);
        debug!("Request executor registered");
    }

    /// Register or replace an enumeration that argument types may name
    ///
    /// Applies to both engines and survives `reset_for_reload`.
    pub fn register_enum<S: Into<String>>(&self, name: &str, members: impl IntoIterator<Item = (S, i64)>) {
        let members: Vec<(String, i64)> = members.into_iter().map(|(m, v)| (m.into(), v)).collect();
        self.enums.write().register(name, members.clone());
        if let Some(bridge) = self.runtime.read().as_ref().and_then(|r| r.bridge.clone()) {
            bridge.register_enum(name, members);
        }
        debug!(enumeration = name, "Enumeration registered");
    }

    /// Run pre-request hooks for `workspace` (and `request`), native first
    pub fn invoke_pre_request(
        &self,
        workspace: &str,
        request: Option<&str>,
        ctx: &mut PreRequestContext,
    ) -> Result<()> {
        let runtime = self.runtime()?;
        step!(self.settings, workspace, request = ?request, "Invoking pre-request hooks");

        runtime.dynamic.with_lua(|lua| -> Result<()> {
            let level = runtime.chains.level(lua, workspace, request)?;
            if let Some(native) = &runtime.native {
                let value = workspace_value(&self.config, Some(workspace));
                level.native_pre(native, &value, ctx)?;
            }
            level.dynamic_pre(lua, ctx)
        })
    }

    /// Run post-response hooks and return the resulting body
    ///
    /// Both engines see the original body. The dynamic result wins unless it
    /// equals the original body and the native result differs.
    pub fn invoke_post_response(
        &self,
        workspace: &str,
        request: Option<&str>,
        ctx: &PostResponseContext,
    ) -> Result<String> {
        let runtime = self.runtime()?;
        step!(self.settings, workspace, request = ?request, "Invoking post-response hooks");

        runtime.dynamic.with_lua(|lua| -> Result<String> {
            let level = runtime.chains.level(lua, workspace, request)?;
            let native_body = match &runtime.native {
                Some(native) => {
                    let value = workspace_value(&self.config, Some(workspace));
                    Some(level.native_post(native, &value, ctx)?)
                }
                None => None,
            };
            let dynamic_body = level.dynamic_post(lua, ctx)?;
            Ok(merge_post_results(&ctx.body, native_body, dynamic_body))
        })
    }

    /// Best-effort precompilation of namespaces, scripts and handler chains
    ///
    /// At most `limit` scripts are compiled. Failures are recorded as
    /// diagnostics and never returned.
    pub fn warmup(&self, limit: usize, enabled: bool, debug: bool) -> WarmupReport {
        let mut report = WarmupReport::default();
        if !enabled {
            return report;
        }
        let Ok(runtime) = self.runtime() else {
            warn!("Warmup skipped: orchestrator is not initialized");
            return report;
        };

        let active_chain = self.active_chain();
        let mut targets: Vec<Option<&str>> = self
            .config
            .workspaces
            .iter()
            .filter(|w| active_chain.as_ref().map_or(true, |chain| chain.contains(&w.name)))
            .map(|w| Some(w.name.as_str()))
            .collect();
        targets.push(None);

        runtime.dynamic.with_lua(|lua| {
            for workspace in targets {
                if let Some(name) = workspace {
                    match runtime.projector.namespace(lua, name) {
                        Ok(Some(_)) => report.namespaces += 1,
                        Ok(None) => continue,
                        Err(e) => {
                            report.failed += 1;
                            self.warmup_failure(Some(name), &e);
                            continue;
                        }
                    }
                    match runtime.chains.workspace_level(lua, name) {
                        Ok(_) => report.chains += 1,
                        Err(e) => {
                            report.failed += 1;
                            self.warmup_failure(Some(name), &e);
                        }
                    }
                }

                for script in runtime.projector.own_scripts(workspace) {
                    if report.compiled >= limit {
                        break;
                    }
                    let warmed = runtime
                        .projector
                        .compile(lua, workspace, &script)
                        .and_then(|compiled| Ok(Self::warm_native(&runtime, workspace, &script)? || compiled));
                    match warmed {
                        Ok(true) => {
                            report.compiled += 1;
                            if debug {
                                tracing::debug!(workspace = ?workspace, script = %script, "Warmed up script");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            report.failed += 1;
                            self.warmup_failure(workspace, &e);
                        }
                    }
                }
            }
        });

        info!(
            namespaces = report.namespaces,
            compiled = report.compiled,
            chains = report.chains,
            failed = report.failed,
            "Warmup finished"
        );
        report
    }

    /// Call script `name` as seen from `workspace` (root scripts for `None`)
    ///
    /// Arguments are coerced to the declared types, so text from a command
    /// line works for typed parameters.
    pub fn call_script(&self, workspace: Option<&str>, name: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let runtime = self.runtime()?;
        let (_, definition) = runtime
            .projector
            .script(workspace, name)
            .ok_or_else(|| ScriptError::ScriptNotFound(name.to_string()))?;
        step!(self.settings, workspace = ?workspace, script = name, "Calling script");

        let args = match definition.body.primary() {
            // The bridge coerces for native scripts
            Some((ScriptLanguage::Rhai, _)) => args,
            _ => bind_arguments(name, &definition.arguments, args, &self.enums.read())?
                .into_iter()
                .map(Coerced::into_json)
                .collect(),
        };
        runtime
            .dynamic
            .with_lua(|lua| runtime.projector.call(lua, workspace, name, args))
    }

    /// Evaluate a snippet in the dynamic engine
    pub fn evaluate_dynamic(&self, code: &str) -> Result<HostValue> {
        self.runtime()?.dynamic.evaluate(code)
    }

    /// Evaluate a snippet in the native session
    pub fn evaluate_native(&self, code: &str) -> Result<HostValue> {
        let runtime = self.runtime()?;
        let native = runtime.native.as_ref().ok_or(ScriptError::NativeUnavailable)?;
        native.evaluate(code)
    }

    /// Diagnostics recorded since construction or the last reset
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.entries()
    }

    /// Number of script compilations by the projector
    pub fn compile_count(&self) -> u64 {
        self.runtime
            .read()
            .as_ref()
            .map_or(0, |runtime| runtime.projector.compile_count())
    }

    /// Number of native wrapper compilations
    pub fn wrapper_compile_count(&self) -> u64 {
        self.runtime
            .read()
            .as_ref()
            .and_then(|runtime| runtime.bridge.as_ref().map(|b| b.registry().compile_count()))
            .unwrap_or(0)
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime.read().clone().ok_or(ScriptError::NotInitialized)
    }

    fn active_chain(&self) -> Option<Ancestry> {
        if !self.settings.limit_to_active_chain {
            return None;
        }
        self.config
            .active_workspace
            .as_deref()
            .map(|active| self.config.ancestry(active))
    }

    /// Compile the native wrapper behind a resolved script, if any
    fn warm_native(runtime: &Runtime, workspace: Option<&str>, name: &str) -> Result<bool> {
        let (Some(bridge), Some(def)) = (&runtime.bridge, runtime.projector.native_wrapper(workspace, name)) else {
            return Ok(false);
        };
        if bridge.registry().is_compiled(&def.id) {
            return Ok(false);
        }
        bridge.registry().compiled(&def, bridge.native())?;
        Ok(true)
    }

    fn warmup_failure(&self, workspace: Option<&str>, error: &ScriptError) {
        self.diagnostics
            .record(DiagnosticKind::Warmup, workspace, error.to_string());
    }
}

/// Combine the post-response results of both engines
///
/// The dynamic result wins unless it is byte-for-byte the original body and
/// the native result differs from it.
pub fn merge_post_results(original: &str, native: Option<String>, dynamic: String) -> String {
    match native {
        Some(native) if dynamic == original && native != original => native,
        _ => dynamic,
    }
}
