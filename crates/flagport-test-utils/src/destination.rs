//! In-memory destination API
//!
//! Implements the subset of the v2 REST surface the migration engine uses,
//! with server-assigned variation ids, 409 on duplicate keys, 405 on patches
//! to gated environments, and scripted one-shot responses or transport
//! failures that take precedence over the simulated behavior.

use async_trait::async_trait;
use flagport_api::header::HeaderMap;
use flagport_api::{ApiError, ApiRequest, ApiResponse, HttpTransport, Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// One request seen by the fake
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
struct Project {
    key: String,
    name: String,
    environments: Vec<Value>,
    flags: BTreeMap<String, Value>,
    segments: BTreeMap<(String, String), Value>,
    views: BTreeMap<String, Value>,
    view_links: BTreeMap<String, Vec<String>>,
    approvals: BTreeMap<(String, String), Vec<Value>>,
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<String, Project>,
    gated: BTreeSet<String>,
    member: Option<String>,
    scripted: HashMap<(Method, String), VecDeque<ApiResponse>>,
    failures: HashMap<(Method, String), usize>,
    next_id: u64,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Fake destination; share it as `Arc<FakeDestination>` between the client and assertions
#[derive(Debug, Default)]
pub struct FakeDestination {
    state: Mutex<State>,
    requests: Mutex<Vec<RecordedRequest>>,
}

fn respond(status: u16, body: Value) -> ApiResponse {
    ApiResponse::new(
        StatusCode::from_u16(status).unwrap(),
        HeaderMap::new(),
        body,
    )
}

fn not_found() -> ApiResponse {
    respond(404, json!({"code": "not_found", "message": "Unknown resource"}))
}

fn conflict() -> ApiResponse {
    respond(409, json!({"code": "conflict", "message": "key already exists"}))
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Setup ====================

    #[must_use]
    pub fn with_project(self, key: &str, environments: &[&str]) -> Self {
        {
            let mut state = self.state.lock();
            let project = state.projects.entry(key.to_string()).or_default();
            project.key = key.to_string();
            project.name = key.to_string();
            for env in environments {
                project
                    .environments
                    .push(json!({"_id": format!("dst-env-{env}"), "key": env, "name": env}));
            }
        }
        self
    }

    /// Store a flag as if created through the API (ids assigned, defaults filled)
    #[must_use]
    pub fn with_flag(self, project: &str, flag: Value) -> Self {
        {
            let mut state = self.state.lock();
            let stored = Self::materialize_flag(&mut state, project, flag);
            let key = stored["key"].as_str().unwrap().to_string();
            state
                .projects
                .get_mut(project)
                .unwrap()
                .flags
                .insert(key, stored);
        }
        self
    }

    #[must_use]
    pub fn with_segment(self, project: &str, env: &str, segment: Value) -> Self {
        {
            let mut state = self.state.lock();
            let stored = Self::materialize_segment(&mut state, segment);
            let key = stored["key"].as_str().unwrap().to_string();
            state
                .projects
                .get_mut(project)
                .unwrap()
                .segments
                .insert((env.to_string(), key), stored);
        }
        self
    }

    #[must_use]
    pub fn with_view(self, project: &str, key: &str) -> Self {
        self.state
            .lock()
            .projects
            .get_mut(project)
            .unwrap()
            .views
            .insert(key.to_string(), json!({"key": key, "name": key}));
        self
    }

    #[must_use]
    pub fn with_approval(self, project: &str, flag: &str, env: &str, status: &str) -> Self {
        {
            let mut state = self.state.lock();
            let id = state.id("ar");
            state
                .projects
                .get_mut(project)
                .unwrap()
                .approvals
                .entry((flag.to_string(), env.to_string()))
                .or_default()
                .push(json!({"_id": id, "status": status, "instructions": []}));
        }
        self
    }

    /// Patches touching `env` are rejected with 405
    #[must_use]
    pub fn gate(self, env: &str) -> Self {
        self.state.lock().gated.insert(env.to_string());
        self
    }

    /// Member returned by `/members/me`
    #[must_use]
    pub fn with_member(self, id: &str) -> Self {
        self.state.lock().member = Some(id.to_string());
        self
    }

    /// Queue a one-shot response for `method path` (query ignored)
    #[must_use]
    pub fn script(self, method: Method, path: &str, status: u16, body: Value) -> Self {
        self.push_response(method, path, respond(status, body));
        self
    }

    /// Fail the next request to `method path` (query ignored) before it
    /// reaches the simulated API
    #[must_use]
    pub fn fail_once(self, method: Method, path: &str) -> Self {
        *self
            .state
            .lock()
            .failures
            .entry((method, path.to_string()))
            .or_default() += 1;
        self
    }

    pub fn push_response(&self, method: Method, path: &str, response: ApiResponse) {
        self.state
            .lock()
            .scripted
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    // ==================== Inspection ====================

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Requests with `method` whose path starts with `prefix`
    pub fn count(&self, method: &Method, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == *method && r.path.starts_with(prefix))
            .count()
    }

    pub fn patch_count(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == Method::PATCH)
            .count()
    }

    pub fn has_project(&self, key: &str) -> bool {
        self.state.lock().projects.contains_key(key)
    }

    pub fn environment_keys(&self, project: &str) -> Vec<String> {
        self.state
            .lock()
            .projects
            .get(project)
            .map(|p| {
                p.environments
                    .iter()
                    .filter_map(|e| e["key"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn flag(&self, project: &str, key: &str) -> Option<Value> {
        self.state.lock().projects.get(project)?.flags.get(key).cloned()
    }

    pub fn segment(&self, project: &str, env: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .projects
            .get(project)?
            .segments
            .get(&(env.to_string(), key.to_string()))
            .cloned()
    }

    pub fn approvals(&self, project: &str, flag: &str, env: &str) -> Vec<Value> {
        self.state
            .lock()
            .projects
            .get(project)
            .and_then(|p| p.approvals.get(&(flag.to_string(), env.to_string())).cloned())
            .unwrap_or_default()
    }

    pub fn view_links(&self, project: &str, view: &str) -> Vec<String> {
        self.state
            .lock()
            .projects
            .get(project)
            .and_then(|p| p.view_links.get(view).cloned())
            .unwrap_or_default()
    }

    // ==================== Simulation ====================

    fn materialize_flag(state: &mut State, project: &str, mut flag: Value) -> Value {
        let key = flag["key"].as_str().unwrap_or_default().to_string();
        if let Some(variations) = flag.get_mut("variations").and_then(Value::as_array_mut) {
            for (i, variation) in variations.iter_mut().enumerate() {
                variation["_id"] = json!(format!("dst-{key}-{i}"));
            }
        }
        let env_keys: Vec<String> = state
            .projects
            .get(project)
            .map(|p| {
                p.environments
                    .iter()
                    .filter_map(|e| e["key"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut environments = flag
            .get("environments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for env in env_keys {
            environments.entry(env).or_insert_with(|| {
                json!({
                    "on": false,
                    "fallthrough": {"variation": 0},
                    "rules": [],
                    "targets": [],
                    "contextTargets": [],
                    "prerequisites": [],
                    "trackEvents": false,
                    "trackEventsFallthrough": false,
                    "_site": {"href": "/"},
                    "version": 1
                })
            });
        }
        flag["environments"] = Value::Object(environments);
        flag["_version"] = json!(1);
        flag["_links"] = json!({"self": {"href": format!("/api/v2/flags/{project}/{key}")}});
        flag["creationDate"] = json!(state.next_id);
        flag
    }

    fn materialize_segment(state: &mut State, mut segment: Value) -> Value {
        for field in ["included", "excluded", "rules"] {
            if segment.get(field).is_none() {
                segment[field] = json!([]);
            }
        }
        segment["_id"] = json!(state.id("seg"));
        segment["version"] = json!(1);
        segment
    }

    fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let path = request.path.split('?').next().unwrap_or_default().to_string();
        let mut state = self.state.lock();

        if let Some(queue) = state.scripted.get_mut(&(request.method.clone(), path.clone())) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }

        let parts: Vec<&str> = path
            .trim_start_matches("/api/v2/")
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        let body = request.body.clone().unwrap_or(Value::Null);
        match (request.method.as_str(), parts.as_slice()) {
            ("GET", ["members", "me"]) => match &state.member {
                Some(id) => respond(200, json!({"_id": id, "email": "operator@example.com"})),
                None => not_found(),
            },

            ("POST", ["projects"]) => Self::create_project(&mut state, &body),
            ("GET", ["projects", p]) => match state.projects.get(*p) {
                Some(project) => respond(
                    200,
                    json!({
                        "key": project.key,
                        "name": project.name,
                        "environments": {"items": project.environments}
                    }),
                ),
                None => not_found(),
            },
            ("POST", ["projects", p, "environments"]) => {
                let Some(project) = state.projects.get_mut(*p) else {
                    return not_found();
                };
                let key = body["key"].as_str().unwrap_or_default();
                if project.environments.iter().any(|e| e["key"] == key) {
                    return conflict();
                }
                project.environments.push(body.clone());
                respond(201, body)
            }

            ("POST", ["projects", p, "views"]) => {
                let Some(project) = state.projects.get_mut(*p) else {
                    return not_found();
                };
                let key = body["key"].as_str().unwrap_or_default().to_string();
                if project.views.contains_key(&key) {
                    return conflict();
                }
                project.views.insert(key, body.clone());
                respond(201, body)
            }
            ("GET", ["projects", p, "views", v]) => state
                .projects
                .get(*p)
                .and_then(|project| project.views.get(*v))
                .map_or_else(not_found, |view| respond(200, view.clone())),
            ("POST", ["projects", p, "views", v, "link", "flag"]) => {
                let Some(project) = state.projects.get_mut(*p) else {
                    return not_found();
                };
                if !project.views.contains_key(*v) {
                    return not_found();
                }
                let keys: Vec<String> = body["keys"]
                    .as_array()
                    .map(|k| k.iter().filter_map(|k| k.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let links = project.view_links.entry((*v).to_string()).or_default();
                for key in keys {
                    if !links.contains(&key) {
                        links.push(key);
                    }
                }
                respond(200, json!({}))
            }

            ("GET", ["projects", p, "flags", f, "environments", e, "approval-requests"]) => {
                let items = state
                    .projects
                    .get(*p)
                    .and_then(|project| {
                        project.approvals.get(&((*f).to_string(), (*e).to_string()))
                    })
                    .cloned()
                    .unwrap_or_default();
                respond(200, json!({"items": items}))
            }
            ("POST", ["projects", p, "flags", f, "environments", e, "approval-requests"]) => {
                let id = state.id("ar");
                let Some(project) = state.projects.get_mut(*p) else {
                    return not_found();
                };
                if !project.flags.contains_key(*f) {
                    return not_found();
                }
                let mut request = body.clone();
                request["_id"] = json!(id);
                request["status"] = json!("pending");
                project
                    .approvals
                    .entry(((*f).to_string(), (*e).to_string()))
                    .or_default()
                    .push(request.clone());
                respond(201, request)
            }

            ("POST", ["flags", p]) => {
                if !state.projects.contains_key(*p) {
                    return not_found();
                }
                let key = body["key"].as_str().unwrap_or_default().to_string();
                if state.projects[*p].flags.contains_key(&key) {
                    return conflict();
                }
                let stored = Self::materialize_flag(&mut state, p, body);
                if let Some(project) = state.projects.get_mut(*p) {
                    project.flags.insert(key, stored.clone());
                }
                respond(201, stored)
            }
            ("GET", ["flags", p, f]) => state
                .projects
                .get(*p)
                .and_then(|project| project.flags.get(*f))
                .map_or_else(not_found, |flag| respond(200, flag.clone())),
            ("PATCH", ["flags", p, f]) => {
                let gated = state.gated.clone();
                let Some(flag) = state
                    .projects
                    .get_mut(*p)
                    .and_then(|project| project.flags.get_mut(*f))
                else {
                    return not_found();
                };
                let ops = body["patch"].as_array().cloned().unwrap_or_default();
                let touches_gated = ops.iter().any(|op| {
                    let path = op["path"].as_str().unwrap_or_default();
                    gated
                        .iter()
                        .any(|env| path.starts_with(&format!("/environments/{env}/")))
                });
                if touches_gated {
                    return respond(
                        405,
                        json!({
                            "code": "method_not_allowed",
                            "message": "approval is required to modify this environment"
                        }),
                    );
                }
                for op in &ops {
                    if !apply_op(flag, op) {
                        return respond(400, json!({"message": format!("invalid patch {op}")}));
                    }
                }
                respond(200, flag.clone())
            }

            ("POST", ["segments", p, e]) => {
                if !state.projects.contains_key(*p) {
                    return not_found();
                }
                let key = body["key"].as_str().unwrap_or_default().to_string();
                let id = ((*e).to_string(), key);
                if state.projects[*p].segments.contains_key(&id) {
                    return conflict();
                }
                let stored = Self::materialize_segment(&mut state, body);
                if let Some(project) = state.projects.get_mut(*p) {
                    project.segments.insert(id, stored.clone());
                }
                respond(201, stored)
            }
            ("GET", ["segments", p, e, s]) => state
                .projects
                .get(*p)
                .and_then(|project| project.segments.get(&((*e).to_string(), (*s).to_string())))
                .map_or_else(not_found, |segment| respond(200, segment.clone())),
            ("PATCH", ["segments", p, e, s]) => {
                let Some(segment) = state
                    .projects
                    .get_mut(*p)
                    .and_then(|project| {
                        project.segments.get_mut(&((*e).to_string(), (*s).to_string()))
                    })
                else {
                    return not_found();
                };
                for op in body["patch"].as_array().cloned().unwrap_or_default() {
                    if !apply_op(segment, &op) {
                        return respond(400, json!({"message": format!("invalid patch {op}")}));
                    }
                }
                respond(200, segment.clone())
            }

            _ => not_found(),
        }
    }

    fn create_project(state: &mut State, body: &Value) -> ApiResponse {
        let key = body["key"].as_str().unwrap_or_default().to_string();
        if state.projects.contains_key(&key) {
            return conflict();
        }
        let environments: Vec<Value> = body["environments"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        state.projects.insert(
            key.clone(),
            Project {
                key: key.clone(),
                name: body["name"].as_str().unwrap_or(&key).to_string(),
                environments: environments.clone(),
                ..Project::default()
            },
        );
        respond(201, json!({"key": key, "environments": {"items": environments}}))
    }
}

/// Apply one JSON-patch element; `false` when the path cannot be resolved
fn apply_op(doc: &mut Value, op: &Value) -> bool {
    let Some(path) = op["path"].as_str() else {
        return false;
    };
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let Some((last, parents)) = parts.split_last() else {
        return false;
    };

    let mut target = doc;
    for part in parents {
        target = match target {
            Value::Object(map) => map
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return false,
            },
            _ => return false,
        };
    }

    let value = op.get("value").cloned().unwrap_or(Value::Null);
    match (op["op"].as_str().unwrap_or_default(), target) {
        ("add", Value::Array(items)) if *last == "-" => {
            items.push(value);
            true
        }
        ("add" | "replace", Value::Object(map)) => {
            map.insert((*last).to_string(), value);
            true
        }
        ("remove", Value::Object(map)) => map.remove(*last).is_some(),
        _ => false,
    }
}

#[async_trait]
impl HttpTransport for FakeDestination {
    async fn send(&self, request: &ApiRequest) -> flagport_api::Result<ApiResponse> {
        self.requests.lock().push(RecordedRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });
        let path = request.path.split('?').next().unwrap_or_default().to_string();
        if let Some(remaining) = self
            .state
            .lock()
            .failures
            .get_mut(&(request.method.clone(), path))
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            return Err(ApiError::Transport("connection reset by peer".to_string()));
        }
        Ok(self.handle(request))
    }
}
