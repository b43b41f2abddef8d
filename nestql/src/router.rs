//! Path-based dispatch over an [`Engine`].
//!
//! Paths look like `/albums/3/tracks/7/genre`: a resource name, one segment
//! per identity field, then any mix of attribute and relationship segments.
//! To-many relationships take the member's identity segments before
//! resolution continues; to-one relationships continue from their current
//! member.

use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::engine::{DeleteTarget, Engine, ResourceHandle};
use crate::errors::EngineError;
use crate::permissions::{Method, RequestContext};
use crate::query::QueryParams;
use crate::store::Store;
use crate::types::Identity;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: QueryParams,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: QueryParams::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// HTTP-style status suggestion.
    pub status: u16,
    pub body: Value,
    /// Methods allowed on the path; filled for `OPTIONS`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<Method>,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            allow: Vec::new(),
        }
    }

    fn created(body: Value) -> Self {
        Self {
            status: 201,
            body,
            allow: Vec::new(),
        }
    }

    pub fn from_error(error: &EngineError) -> Self {
        Self {
            status: error.kind().status_hint(),
            body: error.to_body(),
            allow: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where a path lands.
enum Target<'e> {
    Collection(ResourceHandle<'e>),
    Entity(ResourceHandle<'e>, Identity),
    Field(ResourceHandle<'e>, Identity, String),
    ToMany(ResourceHandle<'e>, Identity, String),
    ToOne {
        parent: ResourceHandle<'e>,
        identity: Identity,
        relationship: String,
        member: Option<(ResourceHandle<'e>, Identity)>,
    },
}

impl Target<'_> {
    fn allowed(&self, method: Method) -> bool {
        if method == Method::Options {
            return true;
        }
        match self {
            Target::Collection(_) => method != Method::Put,
            Target::Entity(..) => method != Method::Post,
            Target::Field(..) => method != Method::Delete,
            Target::ToMany(..) => matches!(method, Method::Get | Method::Post | Method::Patch),
            Target::ToOne { member, .. } => matches!(method, Method::Get | Method::Post) || member.is_some(),
        }
    }

    fn handle(&self) -> ResourceHandle<'_> {
        match self {
            Target::Collection(handle) | Target::Entity(handle, _) | Target::Field(handle, ..) => *handle,
            Target::ToMany(parent, ..) => *parent,
            Target::ToOne { parent, member, .. } => member.as_ref().map_or(*parent, |(handle, _)| *handle),
        }
    }
}

pub struct Router<'e> {
    engine: &'e Engine,
}

impl<'e> Router<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Runs `request`; errors become responses carrying the error body.
    pub async fn dispatch<S: Store>(&self, store: &mut S, ctx: &RequestContext, request: Request) -> Response {
        match self.try_dispatch(store, ctx, request).await {
            Ok(response) => response,
            Err(err) => {
                debug!("request failed: {err}");
                Response::from_error(&err)
            }
        }
    }

    pub async fn try_dispatch<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        request: Request,
    ) -> Result<Response, EngineError> {
        let Request {
            method,
            path,
            params,
            body,
        } = request;
        debug!("{method} {path}");
        let target = self.resolve(store, ctx, &path).await?;

        if method == Method::Options {
            let allow = target
                .handle()
                .allowed_methods(ctx)
                .into_iter()
                .filter(|method| target.allowed(*method))
                .collect();
            return Ok(Response {
                status: 200,
                body: Value::Null,
                allow,
            });
        }
        if !target.allowed(method) {
            return Err(EngineError::MethodNotAllowed {
                method: method.as_str().to_string(),
                path,
            });
        }

        let body = || body.clone().ok_or_else(|| EngineError::bad_request("request body is required"));
        match target {
            Target::Collection(handle) => match method {
                Method::Get => Ok(Response::ok(serde_json::to_value(handle.list(store, ctx, &params).await?)?)),
                Method::Post => Ok(Response::created(handle.create(store, ctx, body()?, &params).await?)),
                Method::Patch => {
                    let items = handle.patch_collection(store, ctx, body()?, &params).await?;
                    Ok(Response::ok(Value::Array(items)))
                }
                _ => {
                    let outcome = handle.delete(store, ctx, DeleteTarget::Query(&params)).await?;
                    Ok(Response::ok(serde_json::to_value(outcome)?))
                }
            },
            Target::Entity(handle, identity) => self.entity(store, ctx, handle, &identity, method, body, &params).await,
            Target::Field(handle, identity, field) => match method {
                Method::Get => Ok(Response::ok(handle.get_field(store, ctx, &identity, &field).await?)),
                _ => Ok(Response::ok(handle.update_field(store, ctx, &identity, &field, body()?).await?)),
            },
            Target::ToMany(parent, identity, relationship) => match method {
                Method::Get => {
                    let collection = parent.list_related(store, ctx, &identity, &relationship, &params).await?;
                    Ok(Response::ok(serde_json::to_value(collection)?))
                }
                Method::Post => Ok(Response::created(
                    parent
                        .create_related(store, ctx, &identity, &relationship, body()?, &params)
                        .await?,
                )),
                _ => {
                    let collection = parent
                        .patch_related(store, ctx, &identity, &relationship, body()?, &params)
                        .await?;
                    Ok(Response::ok(serde_json::to_value(collection)?))
                }
            },
            Target::ToOne {
                parent,
                identity,
                relationship,
                member,
            } => match (method, member) {
                (Method::Get, _) => Ok(Response::ok(
                    parent
                        .get_related_one(store, ctx, &identity, &relationship, &params)
                        .await?,
                )),
                (Method::Post, _) => Ok(Response::created(
                    parent
                        .create_related(store, ctx, &identity, &relationship, body()?, &params)
                        .await?,
                )),
                (_, Some((handle, member))) => self.entity(store, ctx, handle, &member, method, body, &params).await,
                (_, None) => Err(EngineError::not_found(&parent.descriptor().name, format!("{identity}/{relationship}"))),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn entity<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        handle: ResourceHandle<'_>,
        identity: &Identity,
        method: Method,
        body: impl Fn() -> Result<Value, EngineError>,
        params: &QueryParams,
    ) -> Result<Response, EngineError> {
        match method {
            Method::Get => Ok(Response::ok(handle.get(store, ctx, identity, params).await?)),
            Method::Put => Ok(Response::ok(handle.update(store, ctx, identity, body()?, true, params).await?)),
            Method::Patch => Ok(Response::ok(handle.update(store, ctx, identity, body()?, false, params).await?)),
            Method::Delete => {
                let outcome = handle.delete(store, ctx, DeleteTarget::Identity(identity)).await?;
                Ok(Response::ok(serde_json::to_value(outcome)?))
            }
            Method::Post | Method::Options => Err(EngineError::MethodNotAllowed {
                method: method.as_str().to_string(),
                path: format!("{}/{identity}", handle.name()),
            }),
        }
    }

    async fn resolve<S: Store>(&self, store: &mut S, ctx: &RequestContext, path: &str) -> Result<Target<'e>, EngineError> {
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        let Some((resource, mut rest)) = segments.split_first() else {
            return Err(EngineError::not_found("/", path));
        };
        let mut handle = self.engine.resource(resource)?;
        if rest.is_empty() {
            return Ok(Target::Collection(handle));
        }
        let mut identity = take_identity(handle, &mut rest, path)?;

        loop {
            let Some((segment, tail)) = rest.split_first() else {
                return Ok(Target::Entity(handle, identity));
            };
            rest = tail;
            let descriptor = handle.descriptor();
            if descriptor.find_field(segment).is_some() {
                if !rest.is_empty() {
                    return Err(EngineError::not_found(&descriptor.name, path));
                }
                return Ok(Target::Field(handle, identity, segment.to_string()));
            }
            let Some(relationship) = descriptor.find_relationship(segment) else {
                return Err(EngineError::not_found(&descriptor.name, path));
            };
            handle.ensure_visible(store, ctx, &identity).await?;
            let (_, target) = handle.related(segment)?;

            if relationship.is_many() {
                if rest.is_empty() {
                    return Ok(Target::ToMany(handle, identity, segment.to_string()));
                }
                let child = take_identity(target, &mut rest, path)?;
                if !handle.has_member(store, ctx, &identity, segment, &child).await? {
                    return Err(EngineError::not_found(&target.descriptor().name, &child));
                }
                handle = target;
                identity = child;
                continue;
            }

            let member = handle.related_identity(store, ctx, &identity, segment).await?;
            if rest.is_empty() {
                return Ok(Target::ToOne {
                    parent: handle,
                    identity,
                    relationship: segment.to_string(),
                    member: member.map(|member| (target, member)),
                });
            }
            let Some(member) = member else {
                return Err(EngineError::not_found(&target.descriptor().name, path));
            };
            handle = target;
            identity = member;
        }
    }
}

/// Consumes one segment per identity field of `handle`.
fn take_identity(handle: ResourceHandle<'_>, rest: &mut &[&str], path: &str) -> Result<Identity, EngineError> {
    let descriptor = handle.descriptor();
    let width = descriptor.identity.len();
    if rest.len() < width {
        return Err(EngineError::not_found(&descriptor.name, path));
    }
    let (segments, tail) = rest.split_at(width);
    let identity = descriptor
        .parse_identity(segments)
        .ok_or_else(|| EngineError::not_found(&descriptor.name, path))?;
    *rest = tail;
    Ok(identity)
}
