// src/schema.rs
//
// Field dispatch: controllers contribute named query and mutation fields, the
// schema merges them, and two HTTP routes execute one field per request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, error};
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Map, Value};

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::models::{MagicBox, Note, Team, User};
use crate::registry::Controller;

pub type Args = Map<String, Value>;
pub type Resolved = Result<Value, ApiError>;

type ResolveFn = dyn Fn(ResolveContext) -> BoxFuture<'static, Resolved> + Send + Sync;

/// The object a field is being resolved on.
#[derive(Debug, Clone)]
pub enum Node {
    Root,
    User(User),
    Team(Team),
    MagicBox(MagicBox),
    Note(Note),
}

#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub viewer: Option<ObjectId>,
    pub args: Args,
    pub source: Node,
    /// How many more levels of relation fields may still be rendered.
    pub depth: u8,
}

impl ResolveContext {
    pub fn root(viewer: Option<ObjectId>, args: Args, depth: u8) -> Self {
        ResolveContext {
            viewer,
            args,
            source: Node::Root,
            depth,
        }
    }

    /// Context for rendering `source` one level down, or `None` once the
    /// depth budget is spent.
    pub fn nested(&self, source: Node) -> Option<Self> {
        if self.depth == 0 {
            return None;
        }
        Some(ResolveContext {
            viewer: self.viewer,
            args: Args::new(),
            source,
            depth: self.depth - 1,
        })
    }

    /// Same level, different source. Used when a list renders its items.
    pub fn with_source(&self, source: Node) -> Self {
        ResolveContext {
            viewer: self.viewer,
            args: Args::new(),
            source,
            depth: self.depth,
        }
    }

    /// The same context seen by `viewer`, for results that belong to a user
    /// who was not yet logged in when the request started.
    pub fn viewed_by(self, viewer: ObjectId) -> Self {
        ResolveContext {
            viewer: Some(viewer),
            ..self
        }
    }

    pub fn require_viewer(&self) -> Result<ObjectId, ApiError> {
        self.viewer
            .ok_or_else(|| ApiError::Unauthorized("you must be logged in".to_string()))
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<&str>, ApiError> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(ApiError::BadRequest(format!("{} must be a string", name))),
        }
    }

    pub fn str_arg(&self, name: &str) -> Result<&str, ApiError> {
        self.opt_str(name)?
            .ok_or_else(|| ApiError::BadRequest(format!("missing argument {}", name)))
    }

    pub fn str_or<'a>(&'a self, name: &str, default: &'a str) -> Result<&'a str, ApiError> {
        Ok(self.opt_str(name)?.unwrap_or(default))
    }

    pub fn int_or(&self, name: &str, default: i64) -> Result<i64, ApiError> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| ApiError::BadRequest(format!("{} must be an integer", name))),
        }
    }

    pub fn id_arg(&self, name: &str) -> Result<ObjectId, ApiError> {
        parse_id(self.str_arg(name)?)
    }

    pub fn date_arg(&self, name: &str) -> Result<DateTime<Utc>, ApiError> {
        let raw = self.str_arg(name)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|_| {
                ApiError::BadRequest(format!(
                    "{} is expected in RFC 3339 format, e.g. 2018-05-31T08:00:00.000Z",
                    name
                ))
            })
    }
}

pub fn parse_id(raw: &str) -> Result<ObjectId, ApiError> {
    ObjectId::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("{} is not a valid ID", raw)))
}

/// A resolver controllers hand around. An output type is a field that renders
/// its context's source.
#[derive(Clone)]
pub struct Field {
    resolve: Arc<ResolveFn>,
}

pub type OutputType = Field;
pub type Fields = HashMap<&'static str, Field>;

impl Field {
    pub fn new<F, Fut>(resolve: F) -> Self
    where
        F: Fn(ResolveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resolved> + Send + 'static,
    {
        Field {
            resolve: Arc::new(move |ctx: ResolveContext| -> BoxFuture<'static, Resolved> {
                Box::pin(resolve(ctx))
            }),
        }
    }

    pub async fn resolve(&self, ctx: ResolveContext) -> Resolved {
        (self.resolve)(ctx).await
    }

    /// Renders a list of sources at the same depth.
    pub async fn resolve_all(&self, ctx: &ResolveContext, sources: Vec<Node>) -> Resolved {
        let mut rendered = Vec::with_capacity(sources.len());
        for source in sources {
            rendered.push(self.resolve(ctx.with_source(source)).await?);
        }
        Ok(Value::Array(rendered))
    }
}

/// `{nodes, totalCount}` page shape shared by list fields.
pub fn page(nodes: Value) -> Value {
    let total = nodes.as_array().map_or(0, Vec::len);
    json!({ "nodes": nodes, "totalCount": total })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Mutation,
}

pub struct Schema {
    queries: Fields,
    mutations: Fields,
    max_depth: u8,
}

fn merge(target: &mut Fields, source: Fields, controller: &str, operation: &str) {
    for (name, field) in source {
        if target.insert(name, field).is_some() {
            let message = format!(
                "{} field {} from controller {} is already defined",
                operation, name, controller
            );
            error!("{}", message);
            panic!("{}", message);
        }
    }
}

impl Schema {
    /// Merges every controller's fields. A name defined twice is a wiring bug
    /// and aborts startup.
    pub fn build(controllers: Vec<(String, Arc<dyn Controller>)>, max_depth: u8) -> Self {
        let mut queries = Fields::new();
        let mut mutations = Fields::new();
        for (name, controller) in controllers {
            merge(&mut queries, Arc::clone(&controller).queries(), &name, "query");
            merge(&mut mutations, controller.mutations(), &name, "mutation");
        }
        Schema {
            queries,
            mutations,
            max_depth,
        }
    }

    pub fn has(&self, operation: Operation, name: &str) -> bool {
        self.fields(operation).contains_key(name)
    }

    fn fields(&self, operation: Operation) -> &Fields {
        match operation {
            Operation::Query => &self.queries,
            Operation::Mutation => &self.mutations,
        }
    }

    pub async fn execute(
        &self,
        operation: Operation,
        name: &str,
        viewer: Option<ObjectId>,
        args: Args,
    ) -> Resolved {
        let field = self
            .fields(operation)
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("unknown field {}", name)))?;
        debug!("Executing {:?} {}", operation, name);
        field
            .resolve(ResolveContext::root(viewer, args, self.max_depth))
            .await
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

async fn execute_http(
    req: HttpRequest,
    data: web::Data<AppState>,
    operation: Operation,
    name: String,
    args: Option<web::Json<Args>>,
) -> Result<HttpResponse, ApiError> {
    let viewer = req.extensions().get::<CurrentUser>().map(|user| user.0);
    let args = args.map(web::Json::into_inner).unwrap_or_default();
    let value = data.schema.execute(operation, &name, viewer, args).await?;
    Ok(HttpResponse::Ok().json(json!({ "data": value })))
}

// POST /api/query/{field}
pub async fn query(
    req: HttpRequest,
    data: web::Data<AppState>,
    field: web::Path<String>,
    args: Option<web::Json<Args>>,
) -> Result<HttpResponse, ApiError> {
    execute_http(req, data, Operation::Query, field.into_inner(), args).await
}

// POST /api/mutation/{field}
pub async fn mutation(
    req: HttpRequest,
    data: web::Data<AppState>,
    field: web::Path<String>,
    args: Option<web::Json<Args>>,
) -> Result<HttpResponse, ApiError> {
    execute_http(req, data, Operation::Mutation, field.into_inner(), args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Field {
        Field::new(|ctx: ResolveContext| async move { Ok(Value::Object(ctx.args)) })
    }

    #[tokio::test]
    async fn execute_dispatches_by_operation() {
        let mut queries = Fields::new();
        queries.insert("echo", echo());
        let schema = Schema {
            queries,
            mutations: Fields::new(),
            max_depth: 2,
        };

        let mut args = Args::new();
        args.insert("x".into(), json!(1));
        let value = schema
            .execute(Operation::Query, "echo", None, args)
            .await
            .unwrap();
        assert_eq!(value, json!({ "x": 1 }));

        let err = schema
            .execute(Operation::Mutation, "echo", None, Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn nested_contexts_spend_depth() {
        let ctx = ResolveContext::root(None, Args::new(), 1);
        let child = ctx.nested(Node::Root).unwrap();
        assert_eq!(child.depth, 0);
        assert!(child.nested(Node::Root).is_none());
    }

    #[test]
    fn argument_helpers_report_bad_input() {
        let mut args = Args::new();
        args.insert("id".into(), json!("not-hex"));
        args.insert("openDate".into(), json!("tomorrow"));
        args.insert("limit".into(), json!("ten"));
        let ctx = ResolveContext::root(None, args, 0);

        assert!(matches!(ctx.id_arg("id"), Err(ApiError::BadRequest(_))));
        assert!(matches!(ctx.date_arg("openDate"), Err(ApiError::BadRequest(_))));
        assert!(matches!(ctx.int_or("limit", 0), Err(ApiError::BadRequest(_))));
        assert!(matches!(ctx.str_arg("missing"), Err(ApiError::BadRequest(_))));
        assert_eq!(ctx.int_or("offset", 5).unwrap(), 5);
    }

    #[test]
    fn pages_count_their_nodes() {
        assert_eq!(page(json!([1, 2])), json!({ "nodes": [1, 2], "totalCount": 2 }));
    }

    #[test]
    #[should_panic(expected = "already defined")]
    fn duplicate_fields_abort_the_build() {
        let mut target = Fields::new();
        let mut first = Fields::new();
        first.insert("team", echo());
        merge(&mut target, first, "team", "query");
        let mut second = Fields::new();
        second.insert("team", echo());
        merge(&mut target, second, "other", "query");
    }
}
