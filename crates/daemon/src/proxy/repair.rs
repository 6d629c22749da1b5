//! Consistency repair for proxy configuration files
//!
//! Finds directives repeated inside one block and upstreams that point at
//! ports no running instance owns. Only duplicates are removed; stale
//! upstreams are reported and left alone, since a port may belong to a
//! service this daemon does not know about.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tenantmux_common::nginx::{self, Block, Directive, Node};
use tenantmux_common::Result;

/// Directives nginx accepts several times in one block. A repeat of one of
/// these only counts as a duplicate when every argument matches too.
const MULTI_VALUED: &[&str] = &[
    "add_header",
    "allow",
    "deny",
    "error_page",
    "fastcgi_param",
    "include",
    "listen",
    "proxy_hide_header",
    "proxy_pass_header",
    "proxy_set_header",
    "return",
    "rewrite",
    "server",
    "set",
    "sub_filter",
    "uwsgi_param",
];

/// A directive removed because an earlier one in the same block supersedes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateDirective {
    /// Header of the enclosing block (`main` at top level)
    pub block: String,
    pub directive: String,
    pub line: usize,
    /// Line of the occurrence that is kept
    pub kept_line: usize,
}

/// An upstream that matches no running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleUpstream {
    pub block: String,
    pub target: String,
    pub port: u16,
    pub line: usize,
}

/// What a repair pass found
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub duplicates: Vec<DuplicateDirective>,
    pub stale_upstreams: Vec<StaleUpstream>,
    removals: Vec<Range<usize>>,
}

impl Analysis {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty()
    }

    /// `src` with every duplicate cut out; everything else is byte-identical
    pub fn apply(&self, src: &str) -> String {
        let mut ranges = self.removals.clone();
        ranges.sort_by_key(|r| r.start);

        let mut out = String::with_capacity(src.len());
        let mut cursor = 0;
        for range in ranges {
            if range.start < cursor {
                continue;
            }
            out.push_str(&src[cursor..range.start]);
            cursor = range.end;
        }
        out.push_str(&src[cursor..]);
        out
    }
}

/// Scan config text against the ports currently known to be live
pub fn analyze(src: &str, live_ports: &HashSet<u16>) -> Result<Analysis> {
    let nodes = nginx::parse(src)?;
    let mut analysis = Analysis::default();

    scan_directives(src, "main", top_level(&nodes), &mut analysis);
    nginx::walk_blocks(&nodes, &mut |block: &Block| {
        scan_directives(src, &block.header(), block.directives(), &mut analysis);
    });

    let upstream_names = upstream_names(&nodes);
    nginx::walk_blocks(&nodes, &mut |block: &Block| {
        let header = block.header();
        for directive in block.directives() {
            let targets: Vec<(String, u16)> = match directive.name.as_str() {
                "proxy_pass" => directive
                    .args
                    .first()
                    .and_then(|arg| proxy_pass_port(arg, &upstream_names))
                    .into_iter()
                    .collect(),
                "server" if block.name == "upstream" => directive
                    .args
                    .first()
                    .and_then(|arg| host_port(unquote(arg)))
                    .map(|port| (unquote(&directive.args[0]).to_string(), port))
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            };
            for (target, port) in targets {
                if !live_ports.contains(&port) {
                    analysis.stale_upstreams.push(StaleUpstream {
                        block: header.clone(),
                        target,
                        port,
                        line: directive.line,
                    });
                }
            }
        }
    });

    Ok(analysis)
}

fn top_level(nodes: &[Node]) -> impl Iterator<Item = &Directive> {
    nodes.iter().filter_map(|n| match n {
        Node::Directive(d) => Some(d),
        _ => None,
    })
}

fn scan_directives<'a>(
    src: &str,
    block: &str,
    directives: impl Iterator<Item = &'a Directive>,
    analysis: &mut Analysis,
) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for directive in directives {
        let key = if MULTI_VALUED.contains(&directive.name.as_str()) {
            directive.signature()
        } else {
            directive.name.clone()
        };
        match seen.get(&key) {
            Some(&kept_line) => {
                analysis.duplicates.push(DuplicateDirective {
                    block: block.to_string(),
                    directive: directive.signature(),
                    line: directive.line,
                    kept_line,
                });
                analysis
                    .removals
                    .push(nginx::removal_range(src, &directive.span));
            }
            None => {
                seen.insert(key, directive.line);
            }
        }
    }
}

/// Names declared by `upstream name { ... }` blocks
fn upstream_names(nodes: &[Node]) -> HashSet<String> {
    let mut names = HashSet::new();
    nginx::walk_blocks(nodes, &mut |block: &Block| {
        if block.name == "upstream" {
            if let Some(name) = block.args.first() {
                names.insert(unquote(name).to_string());
            }
        }
    });
    names
}

fn unquote(arg: &str) -> &str {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &arg[1..arg.len() - 1]
    } else {
        arg
    }
}

/// Port targeted by a `proxy_pass` argument. Named upstreams are checked
/// through their `server` lines instead, and variables cannot be resolved.
fn proxy_pass_port(arg: &str, upstreams: &HashSet<String>) -> Option<(String, u16)> {
    let target = unquote(arg);
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    if authority.contains('$') || upstreams.contains(authority) {
        return None;
    }
    host_port(authority).map(|port| (target.to_string(), port))
}

fn host_port(authority: &str) -> Option<u16> {
    if authority.starts_with("unix:") {
        return None;
    }
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}
