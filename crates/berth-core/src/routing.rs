//! Named routes from event names to orchestrator handlers.
//!
//! Subscriptions keep the bus's wildcard conventions (`release:.*:status`)
//! but each pattern is bound to a closed [`Route`], so handler selection is
//! a `match` instead of string comparisons scattered across handlers.

use std::fmt;

use regex::Regex;

use crate::error::Result;
use crate::event::EventName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `release:create`: start the startable release.
    ReleaseCreated,
    /// `release:<key>:status`: a worker reported on a release extension.
    ReleaseExtensionStatus,
    /// `project:<key>:status`: a worker reported on a project extension.
    ProjectExtensionStatus,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::ReleaseCreated => "release.created",
            Route::ReleaseExtensionStatus => "release_extension.status",
            Route::ProjectExtensionStatus => "project_extension.status",
        }
    }

    /// Subscription pattern on the wire name.
    pub fn pattern(&self) -> &'static str {
        match self {
            Route::ReleaseCreated => "^release:create$",
            Route::ReleaseExtensionStatus => "^release:.*:status$",
            Route::ProjectExtensionStatus => "^project:.*:status$",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of compiled subscriptions; the first match wins.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<(Route, Regex)>,
}

impl RoutingTable {
    pub fn new(routes: &[Route]) -> Result<Self> {
        let routes = routes
            .iter()
            .map(|route| -> Result<(Route, Regex)> { Ok((*route, Regex::new(route.pattern())?)) })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { routes })
    }

    /// The orchestrator's subscriptions.
    pub fn standard() -> Result<Self> {
        Self::new(&[
            Route::ReleaseCreated,
            Route::ReleaseExtensionStatus,
            Route::ProjectExtensionStatus,
        ])
    }

    pub fn route(&self, name: &EventName) -> Option<Route> {
        let wire = name.to_string();
        self.routes
            .iter()
            .find(|(_, re)| re.is_match(&wire))
            .map(|(route, _)| *route)
    }

    /// Subscription patterns, in match order.
    pub fn subscriptions(&self) -> Vec<&str> {
        self.routes.iter().map(|(_, re)| re.as_str()).collect()
    }
}
