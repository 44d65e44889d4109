#[macro_use]
extern crate error_chain;

pub mod config;
pub mod deployment;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod reconcile;
pub mod replication;
pub mod retry;
pub mod storage;
pub mod store;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            HttpRequest(reqwest::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
            Nix(nix::Error);
        }

        errors {
            Validation(msg: String) {
                description("invalid specification")
                display("validation failed: {}", msg)
            }
            Conflict(name: String) {
                description("object was modified concurrently")
                display("conflict while updating '{}'", name)
            }
            NotFound(name: String) {
                description("object not found")
                display("'{}' not found", name)
            }
            AlreadyExists(name: String) {
                description("object already exists")
                display("'{}' already exists", name)
            }
            Timeout(op: String) {
                description("operation timed out")
                display("timeout during {}", op)
            }
            BadRequest(msg: String) {
                description("request rejected")
                display("bad request: {}", msg)
            }
            Internal(msg: String) {
                description("remote internal error")
                display("internal error: {}", msg)
            }
            NoEligibleNode(size: u64) {
                description("no eligible node found")
                display("no eligible node found for a volume of {} bytes", size)
            }
            Fatal(msg: String) {
                description("unrecoverable reconciliation error")
                display("fatal: {}", msg)
            }
        }
    }

    impl Error {
        pub fn is_conflict(&self) -> bool {
            matches!(self.kind(), ErrorKind::Conflict(_))
        }

        pub fn is_not_found(&self) -> bool {
            matches!(self.kind(), ErrorKind::NotFound(_))
        }

        pub fn is_already_exists(&self) -> bool {
            matches!(self.kind(), ErrorKind::AlreadyExists(_))
        }
    }

    /// Shorthand for a validation failure.
    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        ErrorKind::Validation(msg.into()).into()
    }
}
