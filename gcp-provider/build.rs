use std::env;
use std::process::Command;

/// Version reported by `Version` and embedded in the user-agent. An exact tag on a clean tree
/// is a release, anything else is `<VERSION or dev>+<commit>[.dirty]`.
fn get_version() -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(version) = env::var("PROVIDER_VERSION") {
        return Ok(version);
    }

    let version = env::var("VERSION").unwrap_or_else(|_| "dev".to_string());
    let git_commit = get_git_commit().unwrap_or_default();
    let git_tree_state = get_git_tree_state().unwrap_or_else(|_| "dirty".to_string());
    let git_tag = get_git_tag().unwrap_or_default();

    if !git_commit.is_empty() && !git_tag.is_empty() && git_tree_state == "clean" {
        return Ok(git_tag);
    }

    let mut version_str = version;
    match git_commit.get(..7) {
        Some(short_commit) => {
            version_str.push('+');
            version_str.push_str(short_commit);
            if git_tree_state != "clean" {
                version_str.push_str(".dirty");
            }
        }
        None => version_str.push_str("+unknown"),
    }
    Ok(version_str)
}

fn get_git_commit() -> Result<String, Box<dyn std::error::Error>> {
    // set when built within a container
    if let Ok(git_commit) = env::var("GIT_COMMIT") {
        return Ok(git_commit);
    }
    let output = Command::new("git").args(["rev-parse", "HEAD"]).output()?;
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

fn get_git_tree_state() -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(git_tree_state) = env::var("GIT_TREE_STATE") {
        return Ok(git_tree_state);
    }
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .output()?;
    let status_output = String::from_utf8(output.stdout)?;
    if output.status.success() && status_output.trim().is_empty() {
        Ok("clean".to_string())
    } else {
        Ok("dirty".to_string())
    }
}

fn get_git_tag() -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(git_tag) = env::var("GIT_TAG") {
        return Ok(git_tag);
    }
    let output = Command::new("git")
        .args(["describe", "--exact-match", "--tags", "HEAD"])
        .output()?;
    if output.status.success() {
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    } else {
        Ok(String::new())
    }
}

/// Inputs of [`get_version`] besides the git checkout.
const VERSION_ENV_VARS: [&str; 5] = [
    "PROVIDER_VERSION",
    "VERSION",
    "GIT_COMMIT",
    "GIT_TREE_STATE",
    "GIT_TAG",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for var in VERSION_ENV_VARS {
        println!("cargo:rerun-if-env-changed={var}");
    }
    // commits and tags move HEAD or the refs, the sources decide the dirty suffix
    for git_path in ["../.git/HEAD", "../.git/refs", "../.git/index", "src", "build.rs"] {
        if std::path::Path::new(git_path).exists() {
            println!("cargo:rerun-if-changed={git_path}");
        }
    }

    let version = get_version()?;
    println!("cargo:rustc-env=PROVIDER_VERSION={version}");
    Ok(())
}
