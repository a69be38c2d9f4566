//! Embeds the build metadata printed by `murmur --version`.

use vergen_git2::{BuildBuilder, CargoBuilder, Emitter, Git2Builder, RustcBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let git = Git2Builder::default().sha(true).build()?;
    let build = BuildBuilder::default().build_date(true).build()?;
    let target = CargoBuilder::default().target_triple(true).build()?;
    let compiler = RustcBuilder::default().semver(true).build()?;

    // Outside a git checkout VERGEN_GIT_SHA is not emitted and the
    // version string reports "unknown".
    Emitter::default()
        .add_instructions(&git)?
        .add_instructions(&build)?
        .add_instructions(&target)?
        .add_instructions(&compiler)?
        .emit()?;

    Ok(())
}
