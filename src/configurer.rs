//! Configurer (C6): turns the current set of registrations and published
//! certs into a generated nginx-compatible config text and an atomically
//! swapped TLS materials directory.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::cert_store::CertStore;
use crate::config::Config;
use crate::coordinator::CoordinatorClient;
use crate::error::{FrontendError, Result};
use crate::registration::{AuthOperation, ContentServiceType, Registration};
use crate::static_handler::StaticContentHandler;

/// One upstream group: registrations sharing `(userFacingUrlPrefix, upstreamPath)`.
struct UpstreamGroup {
    name: String,
    location: String,
    sticky: bool,
    timeout: u32,
    timeout_tries: u32,
    members: Vec<String>,
}

/// A single proxied location within a server block.
struct LocationEntry {
    registration: Registration,
    group_name: String,
}

pub struct Configurer<'a> {
    config: &'a Config,
    coordinator: &'a CoordinatorClient,
    cert_store: &'a CertStore,
    static_handler: &'a StaticContentHandler,
    ssl_root: PathBuf,
    conf_path: PathBuf,
}

impl<'a> Configurer<'a> {
    #[must_use]
    pub fn new(
        config: &'a Config,
        coordinator: &'a CoordinatorClient,
        cert_store: &'a CertStore,
        static_handler: &'a StaticContentHandler,
        ssl_root: PathBuf,
        conf_path: PathBuf,
    ) -> Self {
        Self { config, coordinator, cert_store, static_handler, ssl_root, conf_path }
    }

    fn other_ssl_half(&self) -> Result<PathBuf> {
        let current_link = self.ssl_root.join("sslCurrent");
        let a = self.ssl_root.join("sslA");
        let b = self.ssl_root.join("sslB");
        let current = std::fs::read_link(&current_link).unwrap_or_else(|_| a.clone());
        Ok(if current == a { b } else { a })
    }

    /// Runs a full configure pass (§4.6 steps 1-8).
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        let new_ssl_dir = self.materialize_ssl_certs().await?;

        self.static_handler.update_static_contents_dict().await?;

        let registrations = self.coordinator.all_registrations().await;
        let (groups, locations) = self.build_groups_and_locations(registrations).await?;
        let ssl_names = self.coordinator.ssl_server_names().await;

        let config_text = self.generate_config_text(&groups, &locations, &new_ssl_dir, &ssl_names)?;
        tokio::fs::write(&self.conf_path, config_text).await?;

        self.relink_ssl_current(&new_ssl_dir).await?;
        self.static_handler.update_static_dir_link().await?;

        Ok(())
    }

    /// Step 1: recreate the inactive ssl half and write out every published cert.
    async fn materialize_ssl_certs(&self) -> Result<PathBuf> {
        let new_ssl_dir = self.other_ssl_half()?;
        if new_ssl_dir.exists() {
            tokio::fs::remove_dir_all(&new_ssl_dir).await?;
        }
        tokio::fs::create_dir_all(&new_ssl_dir).await?;

        for server_name in self.coordinator.ssl_server_names().await {
            match self.cert_store.get(&server_name).await {
                Ok(Some((cert_pem, key_pem))) => {
                    write_mode_0400(&new_ssl_dir.join(format!("{server_name}.crt")), cert_pem.as_bytes()).await?;
                    write_mode_0400(&new_ssl_dir.join(format!("{server_name}.key")), key_pem.as_bytes()).await?;
                }
                Ok(None) => {
                    tracing::warn!(server_name, "ssl node published but cert store has no material");
                }
                Err(err) => {
                    tracing::warn!(server_name, %err, "failed to materialize cert");
                }
            }
        }
        Ok(new_ssl_dir)
    }

    /// Step 3: group registrations and resolve their upstream hostnames.
    async fn build_groups_and_locations(
        &self,
        registrations: Vec<Registration>,
    ) -> Result<(Vec<UpstreamGroup>, Vec<LocationEntry>)> {
        let mut group_names: BTreeMap<(String, String), String> = BTreeMap::new();
        let mut groups: Vec<UpstreamGroup> = Vec::new();
        let mut locations = Vec::new();

        let mut upstream_path_by_prefix: BTreeMap<String, String> = BTreeMap::new();
        for r in &registrations {
            match upstream_path_by_prefix.get(&r.user_facing_url_prefix) {
                Some(existing) if existing != &r.upstream_path => {
                    tracing::warn!(
                        prefix = %r.user_facing_url_prefix,
                        existing,
                        conflicting = %r.upstream_path,
                        "registrations sharing a prefix disagree on upstream path; skipping"
                    );
                    continue;
                }
                _ => {
                    upstream_path_by_prefix.insert(r.user_facing_url_prefix.clone(), r.upstream_path.clone());
                }
            }
        }

        for r in registrations {
            if upstream_path_by_prefix.get(&r.user_facing_url_prefix) != Some(&r.upstream_path) {
                continue;
            }

            let key = (r.user_facing_url_prefix.clone(), r.upstream_path.clone());
            let group_name = if let Some(existing) = group_names.get(&key) {
                existing.clone()
            } else {
                let name = format!("server{}", group_names.len() + 1);
                group_names.insert(key, name.clone());
                name
            };

            let Some((host, _port)) = r.upstream_host_and_port.split_once(':') else {
                tracing::warn!(registration = %r.upstream_host_and_port, "malformed upstream host:port; dropping");
                self.prune_unresolvable(&r).await;
                continue;
            };

            if tokio::net::lookup_host((host, 0)).await.is_err() {
                tracing::warn!(host, "upstream host unresolvable; dropping registration");
                self.prune_unresolvable(&r).await;
                continue;
            }

            let group = match groups.iter_mut().find(|g| g.name == group_name) {
                Some(g) => g,
                None => {
                    groups.push(UpstreamGroup {
                        name: group_name.clone(),
                        location: r.location(),
                        sticky: r.sticky,
                        timeout: r.timeout,
                        timeout_tries: r.timeout_tries,
                        members: Vec::new(),
                    });
                    groups.last_mut().expect("just pushed")
                }
            };
            group.members.push(r.upstream_host_and_port.clone());

            locations.push(LocationEntry { registration: r, group_name });
        }

        Ok((groups, locations))
    }

    /// On DNS failure: remove the offending registration from the
    /// coordination service under the lock and bump the watch (§4.6 step 3).
    async fn prune_unresolvable(&self, r: &Registration) {
        self.coordinator
            .with_lock(|locked| async move {
                if locked.delete_registration(&r.node_name()).await {
                    locked.bump_watch().await;
                }
            })
            .await;
    }

    fn generate_config_text(
        &self,
        groups: &[UpstreamGroup],
        locations: &[LocationEntry],
        ssl_dir: &Path,
        ssl_names: &[String],
    ) -> Result<String> {
        let mut out = String::new();

        emit_tls_wide_settings(&mut out, self.config, &self.config.paths.internal_ca_path);

        for group in groups {
            emit_upstream_block(&mut out, group);
        }

        emit_http_redirect_server(&mut out, self.config);

        let mut by_server: BTreeMap<String, Vec<&LocationEntry>> = BTreeMap::new();
        for entry in locations {
            by_server.entry(entry.registration.server_name().to_string()).or_default().push(entry);
        }

        let mut server_names: Vec<&String> = by_server.keys().collect();
        server_names.sort_by(|a, b| {
            let longest = |name: &str| by_server[name].iter().map(|e| e.registration.location().len()).max().unwrap_or(0);
            longest(b).cmp(&longest(a)).then_with(|| a.cmp(b))
        });

        for server_name in server_names {
            let entries = &by_server[server_name.as_str()];
            let specialized = ssl_dir.join(format!("{server_name}.crt")).exists()
                && ssl_dir.join(format!("{server_name}.key")).exists()
                && ssl_names.iter().any(|n| n == server_name);
            emit_server_block(&mut out, self.config, server_name, entries, specialized)?;
        }

        Ok(out)
    }

    async fn relink_ssl_current(&self, new_ssl_dir: &Path) -> Result<()> {
        let tmp_link = self.ssl_root.join("sslCurrent.tmp");
        if tmp_link.exists() {
            tokio::fs::remove_file(&tmp_link).await.ok();
        }
        #[cfg(unix)]
        tokio::fs::symlink(new_ssl_dir, &tmp_link).await?;
        tokio::fs::rename(&tmp_link, self.ssl_root.join("sslCurrent")).await?;
        Ok(())
    }
}

async fn write_mode_0400(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400)).await?;
    }
    Ok(())
}

fn emit_tls_wide_settings(out: &mut String, config: &Config, ca_path: &str) {
    writeln!(out, "ssl_protocols TLSv1 TLSv1.1 TLSv1.2;").unwrap();
    writeln!(out, "ssl_ciphers HIGH:!aNULL:!MD5:!3DES:!RC4;").unwrap();
    writeln!(out, "ssl_session_timeout 5m;").unwrap();
    writeln!(out, "ssl_prefer_server_ciphers on;").unwrap();
    writeln!(out, "ssl_client_certificate {ca_path};").unwrap();
    writeln!(out, "ssl_verify_client on;").unwrap();
    writeln!(out, "ssl_verify_depth {};", config.server.max_ca_depth).unwrap();
    if let Some(crl) = &config.server.ssl_crl_file {
        writeln!(out, "ssl_crl {crl};").unwrap();
    }
    out.push('\n');
}

fn sticky_cookie_name(location: &str) -> String {
    format!("ezsticky_{}", crate::static_store::hash_bytes(location.as_bytes())[..8].to_string())
}

fn emit_upstream_block(out: &mut String, group: &UpstreamGroup) {
    writeln!(out, "upstream {} {{", group.name).unwrap();
    for member in &group.members {
        write!(out, "    server {member}").unwrap();
        if group.timeout_tries >= 1 {
            write!(out, " max_fails={}", group.timeout_tries).unwrap();
        }
        if (10..=120).contains(&group.timeout) {
            write!(out, " fail_timeout={}s", group.timeout).unwrap();
        }
        out.push_str(";\n");
    }
    if group.sticky {
        writeln!(out, "    sticky cookie {} expires=1h domain=.* path=/;", sticky_cookie_name(&group.location)).unwrap();
    }
    writeln!(out, "}}\n").unwrap();
}

fn emit_http_redirect_server(out: &mut String, config: &Config) {
    writeln!(out, "server {{").unwrap();
    writeln!(out, "    listen {};", config.server.http_port).unwrap();
    writeln!(out, "    return 301 https://$host:{}$request_uri;", config.server.https_port).unwrap();
    writeln!(out, "}}\n").unwrap();
}

fn emit_server_block(
    out: &mut String,
    config: &Config,
    server_name: &str,
    entries: &[&LocationEntry],
    specialized: bool,
) -> Result<()> {
    writeln!(out, "server {{").unwrap();
    writeln!(out, "    listen {} ssl;", config.server.https_port).unwrap();
    writeln!(out, "    server_name {server_name};").unwrap();
    if config.server.default_server_name.as_deref() == Some(server_name) {
        out.push_str("    # default_server\n");
    }
    if config.server.use_proxy_protocol {
        writeln!(out, "    listen {} proxy_protocol;", config.server.https_port).unwrap();
    }
    if specialized {
        writeln!(out, "    ssl_certificate sslCurrent/{server_name}.crt;").unwrap();
        writeln!(out, "    ssl_certificate_key sslCurrent/{server_name}.key;").unwrap();
    }
    writeln!(out, "    location = /favicon.ico {{ alias {}; }}", config.paths.favicon_path).unwrap();

    for entry in entries {
        let r = &entry.registration;
        if r.content_service_type != ContentServiceType::Proxy {
            let static_location = match r.content_service_type {
                ContentServiceType::Hybrid => format!("/{}/ezbappstatic/", r.user_facing_url_prefix),
                ContentServiceType::StaticOnly => format!("/{}/", r.user_facing_url_prefix),
                ContentServiceType::Proxy => unreachable!(),
            };
            writeln!(out, "    location {static_location} {{ root staticCurrent; }}").unwrap();
        }
        emit_proxy_location(out, config, r, &entry.group_name)?;
    }

    writeln!(out, "}}\n").unwrap();
    Ok(())
}

fn emit_proxy_location(out: &mut String, config: &Config, r: &Registration, group_name: &str) -> Result<()> {
    writeln!(out, "    location {} {{", r.location()).unwrap();
    writeln!(out, "        proxy_http_version 1.1;").unwrap();

    let mut headers = vec![
        ("Host".to_string(), host_header_value(r)),
        ("X-Original-Host".to_string(), "$host".to_string()),
        ("X-Original-Request".to_string(), "$request_uri".to_string()),
        ("X-Original-Uri".to_string(), "$request_uri".to_string()),
        ("X-Upstream-Context-Root".to_string(), r.upstream_path.clone()),
        ("X-client-cert-s-dn".to_string(), "$ssl_client_s_dn".to_string()),
    ];
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in &headers {
        writeln!(out, "        proxy_set_header {name} {value};").unwrap();
    }

    writeln!(out, "        proxy_set_header Upgrade $http_upgrade;").unwrap();
    writeln!(out, "        proxy_set_header Connection \"upgrade\";").unwrap();

    if config.server.use_proxy_protocol {
        writeln!(out, "        proxy_set_header X-Real-IP $proxy_protocol_addr;").unwrap();
        writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_protocol_addr;").unwrap();
    } else {
        writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;").unwrap();
        writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;").unwrap();
    }

    writeln!(out, "        proxy_pass https://{group_name}{};", r.upstream_path).unwrap();
    writeln!(out, "        proxy_redirect default;").unwrap();

    if r.upload_file_size > 0 {
        writeln!(out, "        client_max_body_size {}m;", r.upload_file_size).unwrap();
    }
    if r.disable_chunked_transfer_encoding {
        writeln!(out, "        chunked_transfer_encoding off;").unwrap();
    }

    if r.validate_upstream_connection {
        writeln!(out, "        proxy_ssl_certificate {};", config.paths.internal_cert_path).unwrap();
        writeln!(out, "        proxy_ssl_certificate_key {};", config.paths.internal_key_path).unwrap();
        writeln!(out, "        proxy_ssl_trusted_certificate {};", config.paths.internal_ca_path).unwrap();
    }

    for member in [r.upstream_host_and_port.clone()] {
        let Some((host, port)) = member.split_once(':') else {
            return Err(FrontendError::RegistrationInvalid(format!("malformed upstream {member}")));
        };
        for scheme in ["http", "https"] {
            writeln!(
                out,
                "        proxy_redirect {scheme}://{host}:{port}{} {};",
                r.upstream_path,
                r.location()
            )
            .unwrap();
            writeln!(out, "        proxy_redirect {scheme}://{host}{} {};", r.upstream_path, r.location()).unwrap();
        }
    }

    let auth_comment = r
        .auth_operations
        .iter()
        .map(auth_op_label)
        .collect::<Vec<_>>()
        .join(",");
    if !auth_comment.is_empty() {
        writeln!(out, "        # auth: {auth_comment}").unwrap();
    }

    writeln!(out, "    }}\n").unwrap();
    Ok(())
}

fn host_header_value(r: &Registration) -> String {
    r.upstream_host_and_port.split(':').next().unwrap_or_default().to_string()
}

fn auth_op_label(op: &AuthOperation) -> &'static str {
    match op {
        AuthOperation::UserInfo => "user-info",
        AuthOperation::UserJson => "user-json",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_cookie_name_is_deterministic() {
        assert_eq!(sticky_cookie_name("/foo"), sticky_cookie_name("/foo"));
        assert_ne!(sticky_cookie_name("/foo"), sticky_cookie_name("/bar"));
    }

    #[test]
    fn emit_upstream_block_includes_max_fails_and_fail_timeout_within_bounds() {
        let group = UpstreamGroup {
            name: "server1".into(),
            location: "/foo".into(),
            sticky: false,
            timeout: 30,
            timeout_tries: 2,
            members: vec!["10.0.0.1:8443".into()],
        };
        let mut out = String::new();
        emit_upstream_block(&mut out, &group);
        assert!(out.contains("max_fails=2"));
        assert!(out.contains("fail_timeout=30s"));
    }

    #[test]
    fn emit_upstream_block_omits_fail_timeout_outside_bounds() {
        let group = UpstreamGroup {
            name: "server1".into(),
            location: "/foo".into(),
            sticky: false,
            timeout: 5,
            timeout_tries: 0,
            members: vec!["10.0.0.1:8443".into()],
        };
        let mut out = String::new();
        emit_upstream_block(&mut out, &group);
        assert!(!out.contains("fail_timeout"));
        assert!(!out.contains("max_fails"));
    }
}
