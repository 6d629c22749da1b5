//! Reverse-proxy config synthesis
//!
//! Renders one nginx `server` block from the set of running instances. The
//! output is a pure function of its inputs: same running set and branding,
//! byte-identical text.

use crate::config::ProxyConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tenantmux_common::nginx::{self, Block, Node};
use tenantmux_common::{types::*, Error, Result};

/// One proxied tenant path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub tenant_id: String,
    pub path_prefix: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub rewrite_rule: String,
    pub websocket_upgrade: bool,
    /// (original title, replacement)
    pub html_title_substitution: Option<(String, String)>,
}

impl ProxyRoute {
    fn to_block(&self) -> Block {
        let mut block = Block::new("location", ["^~".to_string(), self.path_prefix.clone()])
            .directive("rewrite", [self.rewrite_rule.as_str(), "/$1", "break"])
            .directive(
                "proxy_pass",
                [format!("http://{}:{}", self.upstream_host, self.upstream_port)],
            );
        block = with_proxy_headers(block, self.websocket_upgrade);

        if let Some((from, to)) = &self.html_title_substitution {
            block = block
                .directive("proxy_set_header", ["Accept-Encoding", "\"\""])
                .directive("sub_filter_once", ["on"])
                .directive(
                    "sub_filter",
                    [
                        nginx::quote(&format!("<title>{}</title>", from)),
                        nginx::quote(&format!("<title>{}</title>", to)),
                    ],
                )
                .directive("sub_filter_types", ["text/html"]);
        }
        block
    }
}

fn with_proxy_headers(block: Block, websocket: bool) -> Block {
    let block = if websocket {
        block
            .directive("proxy_http_version", ["1.1"])
            .directive("proxy_set_header", ["Upgrade", "$http_upgrade"])
            .directive("proxy_set_header", ["Connection", "\"upgrade\""])
    } else {
        block
    };
    block
        .directive("proxy_set_header", ["Host", "$host"])
        .directive("proxy_set_header", ["X-Real-IP", "$remote_addr"])
        .directive(
            "proxy_set_header",
            ["X-Forwarded-For", "$proxy_add_x_forwarded_for"],
        )
}

/// Platform routes emitted ahead of tenant routes, in fixed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformRoutes {
    pub root_upstream: String,
    pub static_root: PathBuf,
    pub static_search_paths: Vec<String>,
    pub deny_message: String,
}

impl PlatformRoutes {
    /// Every platform route is mandatory
    pub fn from_config(cfg: &ProxyConfig) -> Result<Self> {
        let root_upstream = cfg
            .root_upstream
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::TemplateMissing("root application upstream".to_string()))?;
        let static_root = cfg
            .static_root
            .clone()
            .ok_or_else(|| Error::TemplateMissing("static asset root".to_string()))?;
        if cfg.static_search_paths.is_empty() {
            return Err(Error::TemplateMissing(
                "static asset search paths".to_string(),
            ));
        }
        let deny_message = cfg
            .deny_message
            .clone()
            .ok_or_else(|| Error::TemplateMissing("access-denied catch-all".to_string()))?;

        Ok(Self {
            root_upstream,
            static_root,
            static_search_paths: cfg.static_search_paths.clone(),
            deny_message,
        })
    }

    fn to_blocks(&self) -> Vec<Block> {
        let root = with_proxy_headers(
            Block::new("location", ["/"])
                .directive("proxy_pass", [format!("http://{}", self.root_upstream)]),
            true,
        );

        let mut try_files = self.static_search_paths.clone();
        try_files.push("=404".to_string());
        let assets = Block::new("location", ["/static/"])
            .directive("root", [self.static_root.display().to_string()])
            .directive("try_files", try_files);

        // Tenant routes use ^~ so they win over this regex
        let deny = Block::new("location", ["~", "^/[^/]+/app(/|$)"])
            .directive("return", ["403".to_string(), nginx::quote(&self.deny_message)]);

        vec![root, assets, deny]
    }
}

/// Rendered proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub snapshot_hash: String,
    pub routes: Vec<ProxyRoute>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    listen: &'a str,
    server_name: &'a str,
    site_title: &'a str,
    platform: &'a PlatformRoutes,
    instances: Vec<(&'a str, u16)>,
}

/// Builds proxy configuration from instance records
#[derive(Debug, Clone)]
pub struct Synthesizer {
    cfg: ProxyConfig,
    original_title: String,
}

impl Synthesizer {
    pub fn new(cfg: ProxyConfig, original_title: impl Into<String>) -> Self {
        Self {
            cfg,
            original_title: original_title.into(),
        }
    }

    /// Routes for every running instance, ascending by tenant id
    pub fn routes(&self, instances: &[Instance], site_title: &str) -> Vec<ProxyRoute> {
        let mut running: Vec<&Instance> = instances.iter().filter(|i| i.is_running()).collect();
        running.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        running
            .into_iter()
            .map(|i| ProxyRoute {
                tenant_id: i.tenant_id.clone(),
                path_prefix: format!("/{}/app/", i.tenant_id),
                upstream_host: "127.0.0.1".to_string(),
                upstream_port: i.port,
                rewrite_rule: format!("^/{}/app/(.*)$", nginx::regex_escape(&i.tenant_id)),
                websocket_upgrade: true,
                html_title_substitution: Some((
                    self.original_title.clone(),
                    site_title.to_string(),
                )),
            })
            .collect()
    }

    pub fn render(&self, instances: &[Instance], site_title: &str) -> Result<Rendered> {
        let platform = PlatformRoutes::from_config(&self.cfg)?;
        let routes = self.routes(instances, site_title);
        let snapshot_hash = self.snapshot_hash(&platform, &routes, site_title)?;

        let mut server = Block::new("server", Vec::<String>::new())
            .directive("listen", [self.cfg.listen.as_str()])
            .directive("server_name", [self.cfg.server_name.as_str()]);
        for block in platform.to_blocks() {
            server = server.block(block);
        }
        for route in &routes {
            server = server.block(route.to_block());
        }

        let nodes = vec![
            comment("Generated by tenantmux; manual edits are overwritten."),
            comment(&format!("snapshot {}", snapshot_hash)),
            Node::Block(server),
        ];

        Ok(Rendered {
            text: nginx::render(&nodes),
            snapshot_hash,
            routes,
        })
    }

    fn snapshot_hash(
        &self,
        platform: &PlatformRoutes,
        routes: &[ProxyRoute],
        site_title: &str,
    ) -> Result<String> {
        let snapshot = Snapshot {
            listen: &self.cfg.listen,
            server_name: &self.cfg.server_name,
            site_title,
            platform,
            instances: routes
                .iter()
                .map(|r| (r.tenant_id.as_str(), r.upstream_port))
                .collect(),
        };
        let canonical = serde_json::to_vec(&snapshot)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

fn comment(text: &str) -> Node {
    Node::Comment(nginx::Comment {
        text: format!(" {}", text),
        span: 0..0,
        line: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(tenant: &str, port: u16, state: ObservedState) -> Instance {
        Instance {
            tenant_id: tenant.to_string(),
            port,
            data_dir: PathBuf::from(format!("/data/{tenant}")),
            app_dir: PathBuf::from("/opt/app"),
            install_status: InstallStatus::Installed,
            desired_state: DesiredState::Running,
            observed_state: state,
            restart_count: 0,
            last_restart_at: None,
            pid: None,
            fault: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn synth() -> Synthesizer {
        Synthesizer::new(ProxyConfig::default(), "SillyTavern")
    }

    #[test]
    fn test_render_is_deterministic_and_ordered() {
        let a = vec![
            instance("carol", 8003, ObservedState::Running),
            instance("alice", 8001, ObservedState::Running),
            instance("bob", 8002, ObservedState::Stopped),
        ];
        let mut b = a.clone();
        b.reverse();

        let first = synth().render(&a, "My Site").unwrap();
        let second = synth().render(&b, "My Site").unwrap();
        assert_eq!(first, second);

        let tenants: Vec<&str> = first.routes.iter().map(|r| r.tenant_id.as_str()).collect();
        assert_eq!(tenants, vec!["alice", "carol"]);
        assert!(!first.text.contains("/bob/app/"));

        let alice = first.text.find("location ^~ /alice/app/").unwrap();
        let carol = first.text.find("location ^~ /carol/app/").unwrap();
        assert!(alice < carol);
    }

    #[test]
    fn test_platform_routes_come_first_in_fixed_order() {
        let rendered = synth()
            .render(&[instance("alice", 8001, ObservedState::Running)], "T")
            .unwrap();
        let root = rendered.text.find("location / {").unwrap();
        let assets = rendered.text.find("location /static/ {").unwrap();
        let deny = rendered.text.find("return 403").unwrap();
        let tenant = rendered.text.find("/alice/app/").unwrap();
        assert!(root < assets && assets < deny && deny < tenant);
        assert!(rendered
            .text
            .contains("try_files $uri $uri/ /index.html =404;"));
    }

    #[test]
    fn test_tenant_route_contents() {
        let rendered = synth()
            .render(&[instance("alice", 8001, ObservedState::Running)], "My Site")
            .unwrap();
        let text = &rendered.text;
        assert!(text.contains("rewrite ^/alice/app/(.*)$ /$1 break;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:8001;"));
        assert!(text.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(text.contains("proxy_set_header Connection \"upgrade\";"));
        assert!(text.contains("sub_filter \"<title>SillyTavern</title>\" \"<title>My Site</title>\";"));

        // The rendered text parses back
        tenantmux_common::nginx::parse(text).unwrap();
    }

    #[test]
    fn test_branding_changes_hash() {
        let running = vec![instance("alice", 8001, ObservedState::Running)];
        let a = synth().render(&running, "One").unwrap();
        let b = synth().render(&running, "Two").unwrap();
        assert_ne!(a.snapshot_hash, b.snapshot_hash);
        assert_eq!(a.snapshot_hash.len(), 64);
    }

    #[test]
    fn test_empty_running_set_still_renders_platform_routes() {
        let rendered = synth()
            .render(&[instance("bob", 8002, ObservedState::Crashed)], "T")
            .unwrap();
        assert!(rendered.routes.is_empty());
        assert!(rendered.text.contains("location / {"));
    }

    #[test]
    fn test_missing_platform_route_aborts() {
        let mut cfg = ProxyConfig::default();
        cfg.static_root = None;
        let err = Synthesizer::new(cfg, "SillyTavern")
            .render(&[], "T")
            .unwrap_err();
        assert!(matches!(err, Error::TemplateMissing(_)));

        let mut cfg = ProxyConfig::default();
        cfg.root_upstream = None;
        assert!(Synthesizer::new(cfg, "SillyTavern").render(&[], "T").is_err());
    }
}
