//! Config-driven request routing.
//!
//! Patterns are literal segments plus single-segment `{name}` wildcards.
//! The table is immutable at request time; reload swaps the whole table
//! atomically.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use data_model::FunctionRegistry;

#[derive(Debug, Clone)]
struct Route {
    method: String,
    segments: Vec<Segment>,
    function_name: String,
    /// Original pattern, surfaced as the event's `resource`.
    pattern: String,
    literal_segments: usize,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `{name}` — matches exactly one path segment.
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub function_name: String,
    pub path_params: HashMap<String, String>,
    pub route_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(RouteMatch),
    /// Some route matched the path but none matched the method.
    MethodNotAllowed,
    NotFound,
}

pub struct RouteMatcher {
    routes: ArcSwap<Vec<Route>>,
}

impl RouteMatcher {
    pub fn new(registry: &FunctionRegistry) -> Self {
        let matcher = Self {
            routes: ArcSwap::from_pointee(Vec::new()),
        };
        matcher.reload(registry);
        matcher
    }

    /// Rebuild the table from the registry and swap it in atomically.
    pub fn reload(&self, registry: &FunctionRegistry) {
        let mut routes = Vec::new();
        for descriptor in registry.descriptors() {
            for route in &descriptor.routes {
                routes.push(parse_route(
                    &route.method,
                    &route.path,
                    &descriptor.name,
                ));
            }
        }
        self.routes.store(Arc::new(routes));
    }

    pub fn match_route(&self, path: &str, method: &str) -> MatchOutcome {
        let routes = self.routes.load();
        let path_segments: Vec<&str> = split_path(path);
        let method = method.to_uppercase();

        let mut best: Option<(&Route, HashMap<String, String>)> = None;
        let mut path_matched = false;

        for route in routes.iter() {
            let Some(params) = match_segments(&route.segments, &path_segments) else {
                continue;
            };
            path_matched = true;
            if route.method != method {
                continue;
            }
            let better = match &best {
                None => true,
                // Most literal segments wins, then the longer pattern.
                Some((current, _)) => {
                    (route.literal_segments, route.segments.len())
                        > (current.literal_segments, current.segments.len())
                }
            };
            if better {
                best = Some((route, params));
            }
        }

        match best {
            Some((route, path_params)) => MatchOutcome::Matched(RouteMatch {
                function_name: route.function_name.clone(),
                path_params,
                route_path: route.pattern.clone(),
            }),
            None if path_matched => MatchOutcome::MethodNotAllowed,
            None => MatchOutcome::NotFound,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_route(method: &str, pattern: &str, function_name: &str) -> Route {
    let segments: Vec<Segment> = split_path(pattern)
        .into_iter()
        .map(|s| {
            if s.starts_with('{') && s.ends_with('}') {
                Segment::Param(s[1..s.len() - 1].to_string())
            } else {
                Segment::Literal(s.to_string())
            }
        })
        .collect();
    let literal_segments = segments
        .iter()
        .filter(|s| matches!(s, Segment::Literal(_)))
        .count();
    Route {
        method: method.to_uppercase(),
        segments,
        function_name: function_name.to_string(),
        pattern: pattern.to_string(),
        literal_segments,
    }
}

fn match_segments(segments: &[Segment], path: &[&str]) -> Option<HashMap<String, String>> {
    if segments.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(path.iter()) {
        match segment {
            Segment::Literal(lit) => {
                if lit != part {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use data_model::{FunctionDescriptor, RouteSpec};

    use super::*;

    fn registry() -> FunctionRegistry {
        let mut hello = FunctionDescriptor::new("hello", "hello:latest");
        hello.routes = vec![
            RouteSpec {
                path: "/api/hello".to_string(),
                method: "GET".to_string(),
            },
            RouteSpec {
                path: "/api/hello/{id}".to_string(),
                method: "GET".to_string(),
            },
        ];
        let mut users = FunctionDescriptor::new("users", "users:latest");
        users.routes = vec![
            RouteSpec {
                path: "/api/{resource}".to_string(),
                method: "POST".to_string(),
            },
            RouteSpec {
                path: "/api/users/{user_id}/posts/{post_id}".to_string(),
                method: "GET".to_string(),
            },
        ];
        FunctionRegistry::new(vec![hello, users])
    }

    #[test]
    fn test_exact_match() {
        let matcher = RouteMatcher::new(&registry());
        let MatchOutcome::Matched(m) = matcher.match_route("/api/hello", "GET") else {
            panic!("expected a match");
        };
        assert_eq!(m.function_name, "hello");
        assert!(m.path_params.is_empty());
    }

    #[test]
    fn test_wildcard_extracts_params() {
        let matcher = RouteMatcher::new(&registry());
        let MatchOutcome::Matched(m) =
            matcher.match_route("/api/users/42/posts/7", "GET")
        else {
            panic!("expected a match");
        };
        assert_eq!(m.function_name, "users");
        assert_eq!(m.path_params.get("user_id").unwrap(), "42");
        assert_eq!(m.path_params.get("post_id").unwrap(), "7");
        assert_eq!(m.route_path, "/api/users/{user_id}/posts/{post_id}");
    }

    #[test]
    fn test_most_literal_segments_wins() {
        let mut a = FunctionDescriptor::new("wild", "wild:latest");
        a.routes = vec![RouteSpec {
            path: "/api/{anything}".to_string(),
            method: "GET".to_string(),
        }];
        let mut b = FunctionDescriptor::new("exact", "exact:latest");
        b.routes = vec![RouteSpec {
            path: "/api/hello".to_string(),
            method: "GET".to_string(),
        }];
        let matcher = RouteMatcher::new(&FunctionRegistry::new(vec![a, b]));

        let MatchOutcome::Matched(m) = matcher.match_route("/api/hello", "GET") else {
            panic!("expected a match");
        };
        assert_eq!(m.function_name, "exact");
    }

    #[test]
    fn test_method_not_allowed() {
        let matcher = RouteMatcher::new(&registry());
        assert_eq!(
            matcher.match_route("/api/hello", "DELETE"),
            MatchOutcome::MethodNotAllowed
        );
    }

    #[test]
    fn test_not_found() {
        let matcher = RouteMatcher::new(&registry());
        assert_eq!(
            matcher.match_route("/nope/nothing", "GET"),
            MatchOutcome::NotFound
        );
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let matcher = RouteMatcher::new(&registry());
        assert!(matches!(
            matcher.match_route("/api/hello", "get"),
            MatchOutcome::Matched(_)
        ));
    }

    #[test]
    fn test_reload_swaps_table() {
        let matcher = RouteMatcher::new(&registry());
        matcher.reload(&FunctionRegistry::new(vec![]));
        assert_eq!(
            matcher.match_route("/api/hello", "GET"),
            MatchOutcome::NotFound
        );
    }
}
