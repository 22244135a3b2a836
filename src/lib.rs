//! debstage builds a Debian package for a single systemd service, and can
//! install the same files straight onto a machine without packaging them.
//!
//! ## how?
//!
//! Every run starts from one immutable [`BuildParameters`] value, resolved
//! from defaults, include files, the environment and command-line overrides.
//! The package build is a [`Pipeline`] of ordered stages: clean, stage the
//! tree, write the control file, install the postinst hook, mark the conffile,
//! and archive. Each stage checks what must hold before and after it runs, so
//! running them out of order is an error rather than a broken package.
//!
//! The same pipeline can run inside a container image; the package is then
//! copied out of a throwaway instance that is always removed afterwards.
//!
//! [`BuildParameters`]: crate::util::config::BuildParameters
//! [`Pipeline`]: crate::pipeline::Pipeline

pub mod artifact;
pub mod fs;
pub mod install;
pub mod pipeline;
pub mod util;

pub mod prelude {
    pub use crate::artifact::{Artifact, ArtifactProducer};
    pub use crate::util::config::{BuildParameters, ConfigResolver};
    pub use crate::util::BuildError;

    pub mod artifact {
        pub use crate::artifact::deb::DebArtifact;
        pub use crate::artifact::staging::StagingTree;
    }

    pub mod producer {
        pub use crate::artifact::deb::DebProducer;
        pub use crate::artifact::docker::{BollardEngine, ContainerEngine, DockerProducer, ImageBuild};
    }

    pub mod pipeline {
        pub use crate::pipeline::{Pipeline, PipelineOutput, Stage};
    }
}
