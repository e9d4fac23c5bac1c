#[macro_use]
extern crate error_chain;

pub mod builders;
pub mod client;
pub mod config;
pub mod crd;
pub mod events;
pub mod graph;
pub mod manager;
pub mod merge;
pub mod model;
pub mod plan;
pub mod transformers;
pub mod update_plan;
pub mod utils;

#[cfg(test)]
mod testing;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
        }

        errors {
            MissingRootVertex {
                description("root vertex not found")
                display("root vertex not found, the transformer chain must add it first")
            }
            WrongVertexType(v: String) {
                description("unexpected vertex type")
                display("unexpected vertex type: {}", v)
            }
            NilAction(v: String) {
                description("vertex action is nil")
                display("vertex action can't be nil: {}", v)
            }
            DuplicateVertex(v: String) {
                description("duplicate vertex")
                display("vertex already exists: {}", v)
            }
            CyclicGraph {
                description("graph has a cycle")
                display("graph has a cycle, walk aborted")
            }
            PrimaryNotFound(key: String) {
                description("primary resource not found")
                display("consensusset {} not found", key)
            }
            Abnormal(msg: String) {
                description("replica set unhealthy")
                display("cluster unhealthy: {}", msg)
            }
            PrematureStop {
                description("premature stop")
                display("transformer chain stopped prematurely")
            }
        }
    }

    /// True for the sentinel a transformer returns to skip the rest of the chain.
    pub fn is_premature_stop(e: &Error) -> bool {
        matches!(e.kind(), ErrorKind::PrematureStop)
    }

    pub fn is_not_found(e: &Error) -> bool {
        matches!(e.kind(), ErrorKind::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    pub fn is_already_exists(e: &Error) -> bool {
        matches!(e.kind(), ErrorKind::Kube(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists")
    }
}
