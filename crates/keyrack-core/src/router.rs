//! Free-text command routing.
//!
//! Maps a command such as "list my tilda projects" to the service tag whose
//! credentials should serve it. Unrelated to selection itself; the
//! dispatcher glues the two together.

use serde::Serialize;

/// Leading verbs understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    List,
    Show,
    Query,
    Search,
    Run,
    Execute,
    Analyze,
    Create,
}

const VERBS: &[(&str, Verb)] = &[
    ("list", Verb::List),
    ("show", Verb::Show),
    ("query", Verb::Query),
    ("search", Verb::Search),
    ("run", Verb::Run),
    ("execute", Verb::Execute),
    ("analyze", Verb::Analyze),
    ("create", Verb::Create),
];

/// Subject keywords → (action, service), checked in order per verb.
const LIST_TARGETS: &[(&[&str], &str, &str)] = &[
    (&["project", "tilda"], "list_projects", "tilda"),
    (&["file"], "list_files", "filesystem"),
];

const SHOW_TARGETS: &[(&[&str], &str, &str)] = &[
    (&["file"], "show_files", "filesystem"),
    (&["note", "terminal"], "show_notes", "terminal"),
];

const QUERY_TARGETS: &[(&[&str], &str, &str)] = &[(&["bigquery"], "query_bigquery", "bigquery")];

const DEFAULT_QUERY: &str = "SELECT * FROM table LIMIT 10";

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::List => "list",
            Verb::Show => "show",
            Verb::Query => "query",
            Verb::Search => "search",
            Verb::Run => "run",
            Verb::Execute => "execute",
            Verb::Analyze => "analyze",
            Verb::Create => "create",
        }
    }

    /// Match the first word of an already lower-cased command.
    fn parse(word: &str) -> Option<Self> {
        VERBS.iter().find(|(w, _)| *w == word).map(|&(_, v)| v)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub verb: Option<Verb>,
    pub action: String,
    pub service: String,
    /// Remainder of the command the target service should act on.
    pub argument: String,
}

/// Route a command. Anything without a known verb, or with a verb whose
/// subject is not recognised, goes to `fallback`.
pub fn route(command: &str, fallback: &str) -> Route {
    let command = command.trim().to_lowercase();
    let (head, rest) = match command.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (command.as_str(), ""),
    };

    let Some(verb) = Verb::parse(head) else {
        return Route {
            verb: None,
            action: "general_query".to_string(),
            service: fallback.to_string(),
            argument: command.clone(),
        };
    };

    let targeted = |targets: &[(&[&str], &str, &str)]| {
        targets
            .iter()
            .find(|(keywords, ..)| keywords.iter().any(|k| rest.contains(k)))
            .map(|&(_, action, service)| (action.to_string(), service.to_string()))
            .unwrap_or_else(|| (format!("{}_unknown", verb), fallback.to_string()))
    };

    let (action, service, argument) = match verb {
        Verb::List => {
            let (action, service) = targeted(LIST_TARGETS);
            (action, service, rest.to_string())
        }
        Verb::Show => {
            let (action, service) = targeted(SHOW_TARGETS);
            (action, service, rest.to_string())
        }
        Verb::Query => {
            let (action, service) = targeted(QUERY_TARGETS);
            let argument = match rest.split_once("bigquery") {
                Some((_, sql)) if !sql.trim().is_empty() => sql.trim().to_string(),
                Some(_) => DEFAULT_QUERY.to_string(),
                None => rest.to_string(),
            };
            (action, service, argument)
        }
        Verb::Search => ("search".to_string(), "gemini".to_string(), rest.to_string()),
        Verb::Analyze => ("analyze".to_string(), "gemini".to_string(), rest.to_string()),
        Verb::Create => ("create".to_string(), "gemini".to_string(), rest.to_string()),
        Verb::Run => ("run_task".to_string(), "vertex_ai".to_string(), rest.to_string()),
        Verb::Execute => ("execute_task".to_string(), "vertex_ai".to_string(), rest.to_string()),
    };

    Route {
        verb: Some(verb),
        action,
        service,
        argument,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: &str = "gemini";

    #[test]
    fn test_list_projects() {
        let r = route("List my Tilda projects", FALLBACK);
        assert_eq!(r.verb, Some(Verb::List));
        assert_eq!(r.action, "list_projects");
        assert_eq!(r.service, "tilda");
    }

    #[test]
    fn test_list_files_and_unknown() {
        assert_eq!(route("list files", FALLBACK).service, "filesystem");
        let r = route("list everything", FALLBACK);
        assert_eq!(r.action, "list_unknown");
        assert_eq!(r.service, FALLBACK);
    }

    #[test]
    fn test_show_targets() {
        assert_eq!(route("show me my files", FALLBACK).action, "show_files");
        assert_eq!(route("show terminal notes", FALLBACK).service, "terminal");
        assert_eq!(route("show", FALLBACK).action, "show_unknown");
    }

    #[test]
    fn test_query_extracts_sql() {
        let r = route("query bigquery select 1", FALLBACK);
        assert_eq!(r.service, "bigquery");
        assert_eq!(r.argument, "select 1");

        let r = route("query BigQuery", FALLBACK);
        assert_eq!(r.argument, DEFAULT_QUERY);

        let r = route("query the warehouse", FALLBACK);
        assert_eq!(r.action, "query_unknown");
        assert_eq!(r.service, FALLBACK);
    }

    #[test]
    fn test_model_verbs() {
        assert_eq!(route("search rust crates", FALLBACK).service, "gemini");
        assert_eq!(route("search rust crates", FALLBACK).argument, "rust crates");
        assert_eq!(route("analyze my data", FALLBACK).action, "analyze");
        assert_eq!(route("create a landing page", FALLBACK).service, "gemini");
        assert_eq!(route("run optimization task", FALLBACK).service, "vertex_ai");
        assert_eq!(route("execute nightly job", FALLBACK).action, "execute_task");
    }

    #[test]
    fn test_verb_must_be_whole_word() {
        // "running" is not "run"; "listing" is not "list"
        let r = route("running late", FALLBACK);
        assert_eq!(r.verb, None);
        assert_eq!(r.action, "general_query");
        assert_eq!(route("listing", FALLBACK).verb, None);
    }

    #[test]
    fn test_general_fallback() {
        let r = route("  Hello there  ", "openai");
        assert_eq!(r.verb, None);
        assert_eq!(r.service, "openai");
        assert_eq!(r.argument, "hello there");
    }

    #[test]
    fn test_empty_command() {
        let r = route("", FALLBACK);
        assert_eq!(r.action, "general_query");
        assert_eq!(r.service, FALLBACK);
    }
}
