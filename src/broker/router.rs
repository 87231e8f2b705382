// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{
    handshake::{HttpHead, UpgradeRequest},
    session::handler::SessionHandler,
};

type PathPredicate = Box<dyn Fn(&str, &HttpHead) -> bool + Send + Sync>;
type AcceptGuard = Box<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

/// One upgrade route: a path predicate, an optional accept guard (the
/// pluggable authentication point) and the handler wired onto matching
/// sessions.
pub struct Route {
    predicate: PathPredicate,
    guard: Option<AcceptGuard>,
    handler: Arc<dyn SessionHandler>,
}

/// Ordered route table consulted by the acceptor; first match wins.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// Route resolution outcome.
pub enum Resolution<'a> {
    Matched(&'a Route),
    /// A route matched but its guard said no (403).
    Denied,
    /// Nothing matched (404).
    NotFound,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Routes an exact path onto a handler.
    pub fn add_path(
        &mut self,
        path: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
    ) -> &mut Self {
        let path = path.into();
        self.add_predicate(move |p, _| p == path, handler)
    }

    /// Routes by arbitrary predicate over path and headers.
    pub fn add_predicate<P>(
        &mut self,
        predicate: P,
        handler: Arc<dyn SessionHandler>,
    ) -> &mut Self
    where
        P: Fn(&str, &HttpHead) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            predicate: Box::new(predicate),
            guard: None,
            handler,
        });
        self
    }

    /// Like [`add_predicate`](Self::add_predicate), with an accept guard
    /// that may reject the upgrade before a session is created.
    pub fn add_guarded<P, G>(
        &mut self,
        predicate: P,
        guard: G,
        handler: Arc<dyn SessionHandler>,
    ) -> &mut Self
    where
        P: Fn(&str, &HttpHead) -> bool + Send + Sync + 'static,
        G: Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            predicate: Box::new(predicate),
            guard: Some(Box::new(guard)),
            handler,
        });
        self
    }

    pub fn resolve(&self, upgrade: &UpgradeRequest) -> Resolution<'_> {
        for route in &self.routes {
            if !(route.predicate)(&upgrade.path, &upgrade.head) {
                continue;
            }
            if let Some(guard) = &route.guard
                && !guard(upgrade)
            {
                return Resolution::Denied;
            }
            return Resolution::Matched(route);
        }
        Resolution::NotFound
    }
}

impl Route {
    pub fn handler(&self) -> Arc<dyn SessionHandler> {
        Arc::clone(&self.handler)
    }
}
