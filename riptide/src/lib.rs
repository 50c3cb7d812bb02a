//! The user-facing server surface.
//!
//! [`ServerBuilder`] collects configuration, routes, and middleware;
//! [`ServerBuilder::build`] freezes the route table; [`Server::listen`]
//! spawns the worker fleet and starts accepting. Each worker binds its own
//! `SO_REUSEPORT` listener and runs a single-threaded cooperative event
//! loop, so a connection never leaves the thread that accepted it.

mod server;

pub use riptide_core::{
    config::ServerConfig,
    memory::{ArenaKind, ArenaStats},
    metrics::ServerStats,
    AnyError, AnyResult,
};
pub use riptide_services::http::{
    AsyncHandler, Body, BodySource, CancelFlag, Context, CtxValue, Decision, Handler,
    HandlerFuture, HttpError, HttpMethod, MethodSet, Middleware, MiddlewareEntry, Outcome,
    ParamValue, PathParam, Phase, Request, Response, RouteError,
};
pub use server::{Server, ServerBuilder};
