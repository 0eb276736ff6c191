//! Named matchers and mailets, resolved when the configuration is loaded.
//!
//! A processor is configured as a list of stages:
//!
//! ```text
//! (
//!     name: "root",
//!     stages: [
//!         (matcher: "RelayLimit=30", mailet: "Null"),
//!         (matcher: "RecipientIsLocal", mailet: "LocalDelivery"),
//!         (matcher: "All", mailet: "ToProcessor", params: { "processor": "transport" }),
//!     ],
//! )
//! ```
//!
//! Matchers take an optional condition after `=`. Mailets take named
//! string parameters.

use std::{fmt, sync::Arc};

use ahash::{AHashMap, AHashSet};
use postern_spool::MailStore;
use serde::Deserialize;

use crate::{
    LinearProcessor, Mailet, Matcher, Processors, RegistryError,
    mailet::{AddHeader, Bounce, LocalDelivery, Null, ToProcessor},
    matcher::{All, HasHeader, HostIs, HostIsLocal, RecipientIs, RecipientIsLocal, RelayLimit, SenderIs},
};

pub type Params = AHashMap<String, String>;

type MatcherFactory =
    Box<dyn Fn(Option<&str>) -> Result<Arc<dyn Matcher>, RegistryError> + Send + Sync>;
type MailetFactory = Box<dyn Fn(&Params) -> Result<Arc<dyn Mailet>, RegistryError> + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub matcher: String,
    pub mailet: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// What the built-in matchers and mailets need from the server.
#[derive(Debug, Clone, Default)]
pub struct RegistryContext {
    pub local_domains: Arc<[String]>,
    /// Lower-cased names of local users
    pub local_users: Arc<AHashSet<String>>,
    /// Where `LocalDelivery` stores mail
    pub inbox: Option<Arc<dyn MailStore>>,
}

#[derive(Default)]
pub struct Registry {
    matchers: AHashMap<String, MatcherFactory>,
    mailets: AHashMap<String, MailetFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("matchers", &self.matchers.keys().collect::<Vec<_>>())
            .field("mailets", &self.mailets.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn param<'a>(mailet: &str, params: &'a Params, name: &str) -> Result<&'a str, RegistryError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| RegistryError::MissingParameter {
            mailet: mailet.to_string(),
            param: name.to_string(),
        })
}

fn condition<'a>(matcher: &str, condition: Option<&'a str>) -> Result<&'a str, RegistryError> {
    condition.ok_or_else(|| RegistryError::MissingCondition {
        matcher: matcher.to_string(),
    })
}

impl Registry {
    /// A registry holding every built-in matcher and mailet.
    pub fn with_builtins(context: &RegistryContext) -> Self {
        let mut registry = Self::default();

        registry.register_matcher("All", |_| Ok(Arc::new(All)));
        registry.register_matcher("HostIs", |cond| {
            Ok(Arc::new(HostIs::new(condition("HostIs", cond)?)?))
        });
        registry.register_matcher("RecipientIs", |cond| {
            Ok(Arc::new(RecipientIs::new(condition("RecipientIs", cond)?)?))
        });
        registry.register_matcher("SenderIs", |cond| {
            Ok(Arc::new(SenderIs::new(condition("SenderIs", cond)?)?))
        });
        registry.register_matcher("HasHeader", |cond| {
            Ok(Arc::new(HasHeader::new(condition("HasHeader", cond)?)?))
        });
        registry.register_matcher("RelayLimit", |cond| {
            Ok(Arc::new(RelayLimit::new(condition("RelayLimit", cond)?)?))
        });

        let domains = Arc::clone(&context.local_domains);
        registry.register_matcher("HostIsLocal", move |_| {
            Ok(Arc::new(HostIsLocal::new(Arc::clone(&domains))))
        });

        let domains = Arc::clone(&context.local_domains);
        let users = Arc::clone(&context.local_users);
        registry.register_matcher("RecipientIsLocal", move |_| {
            Ok(Arc::new(RecipientIsLocal::new(
                Arc::clone(&domains),
                Arc::clone(&users),
            )))
        });

        registry.register_mailet("Null", |_| Ok(Arc::new(Null)));
        registry.register_mailet("Bounce", |_| Ok(Arc::new(Bounce)));
        registry.register_mailet("ToProcessor", |params| {
            Ok(Arc::new(ToProcessor::new(
                param("ToProcessor", params, "processor")?,
                params.get("notice").cloned(),
            )))
        });
        registry.register_mailet("AddHeader", |params| {
            Ok(Arc::new(AddHeader::new(
                param("AddHeader", params, "name")?,
                param("AddHeader", params, "value")?,
            )))
        });

        let inbox = context.inbox.clone();
        registry.register_mailet("LocalDelivery", move |_| {
            inbox
                .as_ref()
                .map(|inbox| Arc::new(LocalDelivery::new(Arc::clone(inbox))) as Arc<dyn Mailet>)
                .ok_or_else(|| RegistryError::Unavailable {
                    mailet: String::from("LocalDelivery"),
                    reason: String::from("no inbox store is configured"),
                })
        });

        registry
    }

    pub fn register_matcher<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn Matcher>, RegistryError> + Send + Sync + 'static,
    {
        self.matchers.insert(name.into(), Box::new(factory));
    }

    pub fn register_mailet<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Params) -> Result<Arc<dyn Mailet>, RegistryError> + Send + Sync + 'static,
    {
        self.mailets.insert(name.into(), Box::new(factory));
    }

    /// Build a matcher from `Name` or `Name=condition`.
    pub fn matcher(&self, spec: &str) -> Result<Arc<dyn Matcher>, RegistryError> {
        let (name, condition) = spec
            .split_once('=')
            .map_or((spec.trim(), None), |(name, condition)| {
                (name.trim(), Some(condition))
            });

        let factory = self
            .matchers
            .get(name)
            .ok_or_else(|| RegistryError::UnknownMatcher(name.to_string()))?;

        factory(condition)
    }

    pub fn mailet(&self, name: &str, params: &Params) -> Result<Arc<dyn Mailet>, RegistryError> {
        let factory = self
            .mailets
            .get(name)
            .ok_or_else(|| RegistryError::UnknownMailet(name.to_string()))?;

        factory(params)
    }

    pub fn build(&self, configs: &[ProcessorConfig]) -> Result<Processors, RegistryError> {
        let mut processors = Processors::default();

        for config in configs {
            let mut processor = LinearProcessor::new(config.name.clone());
            for stage in &config.stages {
                processor = processor.add(
                    self.matcher(&stage.matcher)?,
                    self.mailet(&stage.mailet, &stage.params)?,
                );
            }

            if processors.insert(processor).is_some() {
                return Err(RegistryError::DuplicateProcessor(config.name.clone()));
            }
        }

        Ok(processors)
    }
}
