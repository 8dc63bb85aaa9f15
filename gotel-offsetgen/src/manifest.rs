// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Tracked applications. Each manifest names the struct fields the probes
//! read, the version axis they move along, and a minimal Go program whose
//! DWARF retains those structs.

use semver::Version;

/// One struct field to extract. `pkg` + `strct` form the index key the
/// runtime looks up ("net/http" + "Request" -> "net/http.Request").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WantedField {
    pub pkg: String,
    pub strct: String,
    pub field: String,
}

impl WantedField {
    pub fn new(pkg: &str, strct: &str, field: &str) -> Self {
        WantedField {
            pkg: pkg.to_string(),
            strct: strct.to_string(),
            field: field.to_string(),
        }
    }

    /// Key of the struct in the offset index and in Go's DWARF.
    pub fn struct_key(&self) -> String {
        format!("{}.{}", self.pkg, self.strct)
    }
}

/// Which versions the fields move along.
#[derive(Debug, Clone)]
pub enum VersionAxis {
    /// Standard-library and runtime structs: one build per toolchain, the
    /// sampled version is the toolchain itself.
    Toolchain,
    /// Third-party structs: cartesian product of library versions and
    /// toolchains, sampled at the library version.
    Library(Vec<Version>),
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: &'static str,
    /// Module to `require` in the rendered go.mod, if any.
    pub module: Option<&'static str>,
    pub axis: VersionAxis,
    pub toolchains: Vec<Version>,
    pub wanted: Vec<WantedField>,
    /// Body of the rendered main.go. The program only has to make the
    /// wanted structs reachable; it is never run.
    pub main_go: &'static str,
}

fn toolchain_sweep() -> Vec<Version> {
    [
        (1, 12),
        (1, 14),
        (1, 16),
        (1, 17),
        (1, 18),
        (1, 19),
        (1, 20),
        (1, 21),
        (1, 22),
    ]
    .into_iter()
    .map(|(major, minor)| Version::new(major, minor, 0))
    .collect()
}

fn grpc_versions() -> Vec<Version> {
    [
        (1, 40, 0),
        (1, 45, 0),
        (1, 50, 0),
        (1, 55, 0),
        (1, 58, 0),
        (1, 60, 0),
        (1, 63, 0),
        (1, 65, 0),
    ]
    .into_iter()
    .map(|(major, minor, patch)| Version::new(major, minor, patch))
    .collect()
}

/// Every Go binary carries the runtime's DWARF, so an empty program is
/// enough to observe `runtime.g`.
const RUNTIME_MAIN: &str = r#"package main

func main() {}
"#;

const NET_HTTP_MAIN: &str = r#"package main

import (
	"net/http"
	"net/url"
)

var (
	req  http.Request
	resp http.Response
	u    url.URL
)

func main() {
	_ = req
	_ = resp
	_ = u
}
"#;

// Declaring a ClientConn pulls the internal transport package, and its
// Stream struct, into the build.
const GRPC_MAIN: &str = r#"package main

import "google.golang.org/grpc"

var conn grpc.ClientConn

func main() {
	_ = conn
}
"#;

pub fn built_in_manifests() -> Vec<Manifest> {
    vec![
        Manifest {
            name: "runtime",
            module: None,
            axis: VersionAxis::Toolchain,
            toolchains: toolchain_sweep(),
            wanted: vec![WantedField::new("runtime", "g", "goid")],
            main_go: RUNTIME_MAIN,
        },
        Manifest {
            name: "net/http",
            module: None,
            axis: VersionAxis::Toolchain,
            toolchains: toolchain_sweep(),
            wanted: vec![
                WantedField::new("net/http", "Request", "Method"),
                WantedField::new("net/http", "Request", "URL"),
                WantedField::new("net/http", "Request", "RemoteAddr"),
                WantedField::new("net/http", "Response", "StatusCode"),
                WantedField::new("net/url", "URL", "Path"),
            ],
            main_go: NET_HTTP_MAIN,
        },
        Manifest {
            name: "google.golang.org/grpc",
            module: Some("google.golang.org/grpc"),
            axis: VersionAxis::Library(grpc_versions()),
            toolchains: vec![Version::new(1, 22, 0)],
            wanted: vec![
                WantedField::new(
                    "google.golang.org/grpc/internal/transport",
                    "Stream",
                    "method",
                ),
                WantedField::new("google.golang.org/grpc/internal/transport", "Stream", "id"),
                WantedField::new("google.golang.org/grpc", "ClientConn", "target"),
            ],
            main_go: GRPC_MAIN,
        },
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_struct_key() {
        let field = WantedField::new("net/http", "Request", "Method");
        assert_eq!(field.struct_key(), "net/http.Request");
    }

    #[test]
    fn test_builtins_cover_every_probe_field() {
        use gotel::probe::{self, Probe as _};

        let manifests = built_in_manifests();
        for probe in probe::registry() {
            for field in probe.fields() {
                let found = manifests.iter().any(|m| {
                    m.wanted
                        .iter()
                        .any(|w| w.struct_key() == field.strct && w.field == field.field)
                });
                assert!(found, "no manifest tracks {}.{}", field.strct, field.field);
            }
        }
    }
}
