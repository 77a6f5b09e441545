//! `Page`, `WebViewId`, and the `name[@group]` / reserved-name grammar
//! (spec §4.F "createPlainWindow", §4.G "Special reserved page names").

use purcmc_types::HandleId;

/// A live page: either a top-level plain window or an embedded widget. Each
/// carries the `(name, group)` it was created under, so a workspace can look
/// it up by page id rather than by container handle (spec §3/§4.G, "a page
/// id is `prefix-name@group`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    PlainWindow {
        container: HandleId,
        view: WebViewId,
        name: String,
        group: Option<String>,
    },
    Widget {
        container: HandleId,
        view: WebViewId,
        name: String,
        group: Option<String>,
    },
}

impl Page {
    pub fn view(&self) -> WebViewId {
        match self {
            Page::PlainWindow { view, .. } | Page::Widget { view, .. } => *view,
        }
    }

    pub fn container(&self) -> HandleId {
        match self {
            Page::PlainWindow { container, .. } | Page::Widget { container, .. } => *container,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Page::PlainWindow { name, .. } | Page::Widget { name, .. } => name,
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Page::PlainWindow { group, .. } | Page::Widget { group, .. } => group.as_deref(),
        }
    }
}

/// A web view's handle, distinct from its containing window/widget handle
/// since the two are registered and destroyed independently (spec §4.G
/// "de-registers both the web view handle and the container handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WebViewId(pub HandleId);

/// A page name as given in a request's `element` field: either a literal
/// identifier or one of the three reserved markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageName {
    Literal(String),
    First,
    Last,
    Active,
}

impl PageName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "_first" => PageName::First,
            "_last" => PageName::Last,
            "_active" => PageName::Active,
            other => PageName::Literal(other.to_string()),
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, PageName::Literal(_))
    }
}

/// Splits a request's `element` value `name[@group]` into its parts, per
/// spec §4.F "parse `element` as `name[@group]`".
pub fn parse_name_and_group(raw: &str) -> (PageName, Option<&str>) {
    match raw.split_once('@') {
        Some((name, group)) => (PageName::parse(name), Some(group)),
        None => (PageName::parse(raw), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_optional_group() {
        assert_eq!(
            parse_name_and_group("main@tools"),
            (PageName::Literal("main".into()), Some("tools"))
        );
        assert_eq!(parse_name_and_group("main"), (PageName::Literal("main".into()), None));
    }

    #[test]
    fn recognizes_reserved_names() {
        assert_eq!(parse_name_and_group("_active").0, PageName::Active);
        assert!(PageName::parse("_first").is_reserved());
        assert!(!PageName::parse("main").is_reserved());
    }
}
