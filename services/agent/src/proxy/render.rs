//! nginx configuration rendering.
//!
//! The artifact is regenerated in full from the route table on every change.
//! Output is deterministic for a given table (routes are iterated in key
//! order) so an unchanged table produces byte-identical configuration.

use std::collections::BTreeMap;
use std::fmt::Write;

use hostdeck_id::AppId;

use super::RouteDescriptor;

/// Upstream read timeout; streaming apps keep connections open for a long
/// time.
const READ_TIMEOUT_SECS: u64 = 3600;

/// Render the full configuration for `routes`.
pub fn render(routes: &BTreeMap<AppId, RouteDescriptor>, listen_port: u16) -> String {
    let mut out = String::new();

    out.push_str("# Generated by hostdeck-agent. Do not edit.\n");
    out.push_str("map $http_upgrade $hostdeck_connection_upgrade {\n");
    out.push_str("    default upgrade;\n");
    out.push_str("    ''      close;\n");
    out.push_str("}\n\n");

    out.push_str("server {\n");
    let _ = writeln!(out, "    listen {listen_port};");

    for (app_id, route) in routes {
        out.push('\n');
        render_location(&mut out, *app_id, route);
    }

    out.push_str("}\n");
    out
}

fn render_location(out: &mut String, app_id: AppId, route: &RouteDescriptor) {
    let _ = writeln!(out, "    location = /apps/{app_id} {{");
    let _ = writeln!(out, "        return 301 /apps/{app_id}/;");
    out.push_str("    }\n");

    let _ = writeln!(out, "    location /apps/{app_id}/ {{");

    for network in &route.access.allow_ips {
        let _ = writeln!(out, "        allow {network};");
    }
    if !route.access.allow_ips.is_empty() {
        out.push_str("        deny all;\n");
    }

    if let Some(token) = &route.access.auth_header {
        let _ = writeln!(
            out,
            "        if ($http_authorization != \"Bearer {token}\") {{ return 403; }}"
        );
    }

    // Trailing slash on proxy_pass strips the /apps/{id}/ prefix.
    let _ = writeln!(out, "        proxy_pass http://127.0.0.1:{}/;", route.port);
    out.push_str("        proxy_http_version 1.1;\n");
    out.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
    out.push_str("        proxy_set_header Connection $hostdeck_connection_upgrade;\n");
    out.push_str("        proxy_set_header Host $host;\n");
    out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-Prefix /apps/{app_id};");
    out.push_str("        proxy_buffering off;\n");
    let _ = writeln!(out, "        proxy_read_timeout {READ_TIMEOUT_SECS}s;");
    out.push_str("    }\n");
}
