//! Route predicates and the portal's route table.

use regex::Regex;
use std::time::Duration;

use crate::cache::Expiration;
use crate::net::{Destination, Request};
use crate::strategy::{CachePolicy, Strategy};

pub const PAGES_PARTITION: &str = "sututeh-pages-v1";
pub const ASSETS_PARTITION: &str = "assets-js-css";
pub const IMAGES_PARTITION: &str = "images-local";
pub const FONTS_PARTITION: &str = "fonts";
pub const NOTICIAS_PARTITION: &str = "api-noticias";
pub const EMPRESA_PARTITION: &str = "api-empresa";
pub const FILES_PARTITION: &str = "files-publicos";

/// Partitions that survive activation.
pub const ACTIVE_PARTITIONS: &[&str] = &[
  PAGES_PARTITION,
  ASSETS_PARTITION,
  IMAGES_PARTITION,
  FONTS_PARTITION,
  NOTICIAS_PARTITION,
  EMPRESA_PARTITION,
  FILES_PARTITION,
];

const DAY: i64 = 24 * 60 * 60;

/// A pure test over a request.
#[derive(Debug, Clone)]
pub enum RoutePredicate {
  /// Request destination is one of these
  Destination(Vec<Destination>),
  /// URL path contains the fragment
  PathContains(String),
  /// URL path matches the pattern
  PathMatches(Regex),
  /// URL origin contains the fragment
  OriginContains(String),
  Any(Vec<RoutePredicate>),
  All(Vec<RoutePredicate>),
}

impl RoutePredicate {
  pub fn path_contains(fragment: &str) -> Self {
    Self::PathContains(fragment.to_string())
  }

  pub fn matches(&self, request: &Request) -> bool {
    match self {
      Self::Destination(destinations) => destinations.contains(&request.destination),
      Self::PathContains(fragment) => request.path().contains(fragment.as_str()),
      Self::PathMatches(pattern) => pattern.is_match(request.path()),
      Self::OriginContains(fragment) => request
        .url
        .origin()
        .ascii_serialization()
        .contains(fragment.as_str()),
      Self::Any(predicates) => predicates.iter().any(|p| p.matches(request)),
      Self::All(predicates) => predicates.iter().all(|p| p.matches(request)),
    }
  }
}

/// One entry of the ordered route table.
#[derive(Debug, Clone)]
pub struct RouteRule {
  pub name: &'static str,
  pub predicate: RoutePredicate,
  pub strategy: Strategy,
}

/// Which top-level page loads get the offline fallback chain.
#[derive(Debug, Clone)]
pub struct NavigationMatcher {
  allowlist: Vec<Regex>,
  denylist: Vec<Regex>,
}

impl NavigationMatcher {
  pub fn new(allowlist: Vec<Regex>, denylist: Vec<Regex>) -> Self {
    Self {
      allowlist,
      denylist,
    }
  }

  /// Public pages only; anything behind login never reaches the chain.
  pub fn portal() -> Self {
    let compile = |patterns: &[&str]| {
      patterns
        .iter()
        .map(|p| Regex::new(p).expect("static navigation pattern"))
        .collect()
    };
    Self::new(
      compile(&["^/$", "^/noticias", "^/quienes-somos", "^/contacto"]),
      compile(&["/login", "/registro", "/admin", "/agremiado"]),
    )
  }

  pub fn matches(&self, request: &Request) -> bool {
    if !request.navigate {
      return false;
    }
    let target = match request.url.query() {
      Some(query) => format!("{}?{}", request.path(), query),
      None => request.path().to_string(),
    };
    self.allowlist.iter().any(|re| re.is_match(&target))
      && !self.denylist.iter().any(|re| re.is_match(&target))
  }
}

/// The runtime route table, evaluated top-down.
pub fn portal_routes(known_origins: &[String], network_timeout: Duration) -> Vec<RouteRule> {
  let cacheable = [0, 200];

  vec![
    RouteRule {
      name: "assets",
      predicate: RoutePredicate::Destination(vec![Destination::Script, Destination::Style]),
      strategy: Strategy::StaleWhileRevalidate(CachePolicy::new(
        ASSETS_PARTITION,
        Expiration::new(60, 7 * DAY),
      )),
    },
    RouteRule {
      name: "images",
      predicate: RoutePredicate::Destination(vec![Destination::Image]),
      strategy: Strategy::CacheFirst(
        CachePolicy::new(IMAGES_PARTITION, Expiration::new(150, 30 * DAY)).with_statuses(&cacheable),
      ),
    },
    RouteRule {
      name: "fonts",
      predicate: RoutePredicate::Destination(vec![Destination::Font]),
      strategy: Strategy::CacheFirst(CachePolicy::new(
        FONTS_PARTITION,
        Expiration::new(30, 365 * DAY),
      )),
    },
    RouteRule {
      name: "api-noticias",
      predicate: RoutePredicate::Any(vec![
        RoutePredicate::path_contains("/api/noticias/publicados"),
        RoutePredicate::PathMatches(
          Regex::new(r"/api/noticias/\d+$").expect("static route pattern"),
        ),
      ]),
      strategy: Strategy::NetworkFirst {
        policy: CachePolicy::new(NOTICIAS_PARTITION, Expiration::new(50, DAY))
          .with_statuses(&cacheable),
        timeout: network_timeout,
      },
    },
    RouteRule {
      name: "api-empresa",
      predicate: RoutePredicate::Any(vec![
        RoutePredicate::path_contains("/api/datos-empresa"),
        RoutePredicate::path_contains("/api/nosotros/vigentes"),
        RoutePredicate::path_contains("/api/puestos"),
      ]),
      strategy: Strategy::NetworkFirst {
        policy: CachePolicy::new(EMPRESA_PARTITION, Expiration::new(20, 7 * DAY))
          .with_statuses(&cacheable),
        timeout: network_timeout,
      },
    },
    RouteRule {
      name: "api-contacto",
      predicate: RoutePredicate::path_contains("/api/contacto"),
      strategy: Strategy::NetworkOnly,
    },
    RouteRule {
      name: "files-publicos",
      predicate: RoutePredicate::All(vec![
        RoutePredicate::Any(
          known_origins
            .iter()
            .map(|origin| RoutePredicate::OriginContains(origin.clone()))
            .collect(),
        ),
        RoutePredicate::Any(vec![
          RoutePredicate::path_contains("/uploads/public/"),
          RoutePredicate::path_contains("/files/public/"),
        ]),
      ]),
      strategy: Strategy::CacheFirst(
        CachePolicy::new(FILES_PARTITION, Expiration::new(100, 30 * DAY)).with_statuses(&cacheable),
      ),
    },
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  fn routes() -> Vec<RouteRule> {
    portal_routes(
      &["sututeh".to_string(), "render.com".to_string()],
      Duration::from_secs(3),
    )
  }

  fn first_match(request: &Request) -> Option<&'static str> {
    routes()
      .into_iter()
      .find(|rule| rule.predicate.matches(request))
      .map(|rule| rule.name)
  }

  #[test]
  fn test_destination_routes() {
    let script = Request::get("https://sututeh.com/static/js/main.js")
      .unwrap()
      .with_destination(Destination::Script);
    let image = Request::get("https://sututeh.com/logo.png")
      .unwrap()
      .with_destination(Destination::Image);
    let font = Request::get("https://fonts.example/a.woff2")
      .unwrap()
      .with_destination(Destination::Font);

    assert_eq!(first_match(&script), Some("assets"));
    assert_eq!(first_match(&image), Some("images"));
    assert_eq!(first_match(&font), Some("fonts"));
  }

  #[test]
  fn test_api_routes() {
    let cases = [
      ("https://api.x/api/noticias/publicados", Some("api-noticias")),
      ("https://api.x/api/noticias/42", Some("api-noticias")),
      ("https://api.x/api/noticias/42/comentarios", None),
      ("https://api.x/api/datos-empresa", Some("api-empresa")),
      ("https://api.x/api/nosotros/vigentes", Some("api-empresa")),
      ("https://api.x/api/puestos", Some("api-empresa")),
      ("https://api.x/api/contacto", Some("api-contacto")),
      ("https://api.x/api/usuarios", None),
    ];
    for (url, expected) in cases {
      assert_eq!(first_match(&Request::get(url).unwrap()), expected, "{}", url);
    }
  }

  #[test]
  fn test_public_files_need_known_origin() {
    let known = Request::get("https://backend-sututeh.onrender.com/uploads/public/doc.pdf").unwrap();
    let unknown = Request::get("https://elsewhere.org/uploads/public/doc.pdf").unwrap();
    assert_eq!(first_match(&known), Some("files-publicos"));
    assert_eq!(first_match(&unknown), None);
  }

  #[test]
  fn test_navigation_allow_and_deny() {
    let matcher = NavigationMatcher::portal();
    let nav = |path: &str| Request::navigation(&format!("https://sututeh.com{}", path)).unwrap();

    assert!(matcher.matches(&nav("/")));
    assert!(matcher.matches(&nav("/noticias/12")));
    assert!(matcher.matches(&nav("/quienes-somos")));
    assert!(matcher.matches(&nav("/contacto")));
    assert!(!matcher.matches(&nav("/login")));
    assert!(!matcher.matches(&nav("/registro")));
    assert!(!matcher.matches(&nav("/admin/usuarios")));
    assert!(!matcher.matches(&nav("/agremiado/perfil")));
    assert!(!matcher.matches(&nav("/noticias/admin")));

    let not_navigation = Request::get("https://sututeh.com/noticias").unwrap();
    assert!(!matcher.matches(&not_navigation));
  }
}
