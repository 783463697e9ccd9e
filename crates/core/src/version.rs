// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol version compatibility.
//!
//! A client may link when its MAJOR.MINOR matches the server's; PATCH level
//! differences are accepted.

/// The protocol version spoken by this build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Check a client-supplied version against a server version.  On mismatch the
/// returned reason is the canonical rejection string, with the server's PATCH
/// level wildcarded.
pub fn check_client_version(server: &str, client: &str) -> Result<(), String> {
    let Some((major, minor)) = major_minor(server) else {
        return Err(format!("krmx server version mismatch (server={server},client={client})"));
    };
    match major_minor(client) {
        Some((cmajor, cminor)) if cmajor == major && cminor == minor => Ok(()),
        _ => Err(format!("krmx server version mismatch (server={major}.{minor}.*,client={client})")),
    }
}

#[cfg(test)]
#[path = "version_tests.rs"]
mod tests;
