//! Feature exposure.
//!
//! A feature is a named capability injected into an instance before the entry
//! script runs. Each feature maps to exactly one exposure action, and the
//! actions always run in the order of [`EXPOSURES`]: later bootstrap scripts
//! may rely on earlier bindings already being visible.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{HostObject, ScriptContext};
use crate::error::{ContextError, InstanceError, InstanceResult};
use crate::events::EventPublisher;
use crate::instance::Instance;

/// Bootstrap script run after the `Async` bridge is bound.
pub const ASYNC_BOOTSTRAP: &str = "async.js";

// ─────────────────────────────────────────────────────────────────────────────
// Feature Vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// The fixed feature vocabulary, declared in exposure order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// The hosting component, bound as `Context`
    Context,
    /// The component's owner, bound as `Root`
    Root,
    /// Async bridge plus its wrapper script
    Async,
    /// Module-resolution hook
    #[serde(alias = "UModule")]
    Module,
}

impl Feature {
    pub const ALL: [Feature; 4] = [Feature::Context, Feature::Root, Feature::Async, Feature::Module];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Context => "Context",
            Feature::Root => "Root",
            Feature::Async => "Async",
            Feature::Module => "Module",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unknown feature name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Context" => Ok(Feature::Context),
            "Root" => Ok(Feature::Root),
            "Async" => Ok(Feature::Async),
            "Module" | "UModule" => Ok(Feature::Module),
            other => Err(UnknownFeature(other.to_string())),
        }
    }
}

/// A set of feature names. Duplicates collapse and order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Feature::ALL.into_iter().collect()
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.0.insert(feature);
        self
    }

    pub fn insert(&mut self, feature: Feature) -> bool {
        self.0.insert(feature)
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }

    /// Parse a list of feature names, failing on the first unknown one.
    pub fn parse<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, UnknownFeature> {
        names.into_iter().map(str::parse).collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exposure Targets
// ─────────────────────────────────────────────────────────────────────────────

/// Object bound as `Async`.
///
/// Script-side wrappers installed by the bootstrap script call back into the
/// host through this bridge; results travel out on the message channel.
#[derive(Clone)]
pub struct AsyncBridge {
    events: EventPublisher,
}

impl AsyncBridge {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }

    /// Hand a script-side result back to the host.
    pub fn emit(&self, name: &str, payload: &str) {
        self.events.emit(name, payload);
    }
}

/// Host objects the exposure actions bind into the script environment.
pub struct ExposureTargets {
    pub component: HostObject,
    pub root: Option<HostObject>,
    pub async_bridge: HostObject,
}

impl ExposureTargets {
    pub fn new(component: HostObject, root: Option<HostObject>, events: EventPublisher) -> Self {
        Self {
            component,
            root,
            async_bridge: Arc::new(AsyncBridge::new(events)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exposure Table
// ─────────────────────────────────────────────────────────────────────────────

type ExposeFn = fn(&dyn ScriptContext, &ExposureTargets) -> Result<(), ContextError>;

/// Exposure actions in the order they run.
pub const EXPOSURES: [(Feature, ExposeFn); 4] = [
    (Feature::Context, expose_context),
    (Feature::Root, expose_root),
    (Feature::Async, expose_async),
    (Feature::Module, expose_module),
];

fn expose_context(ctx: &dyn ScriptContext, targets: &ExposureTargets) -> Result<(), ContextError> {
    ctx.expose("Context", targets.component.clone())
}

fn expose_root(ctx: &dyn ScriptContext, targets: &ExposureTargets) -> Result<(), ContextError> {
    let root = targets
        .root
        .clone()
        .ok_or_else(|| ContextError::Evaluation("component has no owner to expose as Root".to_string()))?;
    ctx.expose("Root", root)
}

fn expose_async(ctx: &dyn ScriptContext, targets: &ExposureTargets) -> Result<(), ContextError> {
    ctx.expose("Async", targets.async_bridge.clone())?;
    let wrapper = ctx.read_script_file(ASYNC_BOOTSTRAP)?;
    ctx.run_script(&wrapper)
}

fn expose_module(ctx: &dyn ScriptContext, _targets: &ExposureTargets) -> Result<(), ContextError> {
    ctx.expose_module_system()
}

/// Runs the exposure actions for a feature set.
pub struct FeatureExposer;

impl FeatureExposer {
    /// Expose every requested feature, in table order.
    ///
    /// Stops at the first failure; the error carries the features that were
    /// already exposed, since their bindings stay in the namespace.
    pub fn expose_all(
        instance: &Instance,
        features: &FeatureSet,
        targets: &ExposureTargets,
    ) -> InstanceResult<Vec<Feature>> {
        let mut exposed = Vec::with_capacity(features.len());

        for (feature, action) in EXPOSURES {
            if !features.contains(feature) {
                continue;
            }

            tracing::debug!(instance = %instance.id(), %feature, "exposing feature");
            if let Err(e) = action(instance.context(), targets) {
                return Err(InstanceError::Exposure {
                    feature,
                    exposed,
                    reason: e.to_string(),
                });
            }
            exposed.push(feature);
        }

        Ok(exposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingContext;

    fn targets(with_root: bool) -> ExposureTargets {
        let root: Option<HostObject> = with_root.then(|| Arc::new("owner") as HostObject);
        ExposureTargets::new(Arc::new("component"), root, EventPublisher::default())
    }

    #[test]
    fn test_table_matches_vocabulary_order() {
        let order: Vec<Feature> = EXPOSURES.iter().map(|(f, _)| *f).collect();
        assert_eq!(order, Feature::ALL.to_vec());
    }

    #[test]
    fn test_parse_names() {
        let set = FeatureSet::parse(["Module", "Context", "Context"]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!("UModule".parse::<Feature>().unwrap(), Feature::Module);
        assert_eq!(
            FeatureSet::parse(["Root", "Gravity"]).unwrap_err(),
            UnknownFeature("Gravity".to_string())
        );
    }

    #[test]
    fn test_expose_all_in_fixed_order() {
        let (ctx, journal) = RecordingContext::new();
        let instance = Instance::new(Arc::new(ctx));

        let features = FeatureSet::new()
            .with(Feature::Module)
            .with(Feature::Async)
            .with(Feature::Context)
            .with(Feature::Root);
        let exposed = FeatureExposer::expose_all(&instance, &features, &targets(true)).unwrap();

        assert_eq!(exposed, Feature::ALL.to_vec());
        assert_eq!(
            journal.entries(),
            vec![
                "expose:Context",
                "expose:Root",
                "expose:Async",
                "read:async.js",
                "run_script",
                "modules",
            ]
        );
    }

    #[test]
    fn test_empty_set_touches_nothing() {
        let (ctx, journal) = RecordingContext::new();
        let instance = Instance::new(Arc::new(ctx));

        let exposed = FeatureExposer::expose_all(&instance, &FeatureSet::new(), &targets(false)).unwrap();
        assert!(exposed.is_empty());
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_failure_reports_partial_exposure() {
        let (ctx, journal) = RecordingContext::new();
        let instance = Instance::new(Arc::new(ctx.without_script(ASYNC_BOOTSTRAP)));

        let features = FeatureSet::all();
        let err = FeatureExposer::expose_all(&instance, &features, &targets(true)).unwrap_err();

        match err {
            InstanceError::Exposure { feature, exposed, .. } => {
                assert_eq!(feature, Feature::Async);
                assert_eq!(exposed, vec![Feature::Context, Feature::Root]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!journal.entries().contains(&"modules".to_string()));
    }

    #[test]
    fn test_root_without_owner_fails() {
        let (ctx, _journal) = RecordingContext::new();
        let instance = Instance::new(Arc::new(ctx));

        let features = FeatureSet::new().with(Feature::Root);
        let err = FeatureExposer::expose_all(&instance, &features, &targets(false)).unwrap_err();
        assert!(matches!(err, InstanceError::Exposure { feature: Feature::Root, .. }));
    }
}
