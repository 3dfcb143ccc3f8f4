use std::path::Path;

use git2::{build::RepoBuilder, Cred, FetchOptions, RemoteCallbacks, Repository};

use crate::error::{AppError, Result};

/// Validate a branch name to prevent argument injection.
/// Rejects names starting with `-` as defence in depth.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('-') {
        return Err(AppError::Git(format!("Invalid branch name: '{name}'")));
    }
    Ok(())
}

/// Only HTTPS remotes are accepted; credentials travel via callback.
pub fn validate_clone_url(url: &str) -> Result<()> {
    if !url.starts_with("https://") {
        return Err(AppError::Git(format!("Expected HTTPS clone URL, got: {url}")));
    }
    Ok(())
}

/// Build `FetchOptions` that authenticate via credential callback when a
/// token is configured. The token is never written to disk.
fn make_fetch_options(token: Option<&str>) -> FetchOptions<'_> {
    let mut opts = FetchOptions::new();
    if let Some(token) = token {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
            Cred::userpass_plaintext("x-access-token", token)
        });
        opts.remote_callbacks(callbacks);
    }
    opts
}

/// Whether `dir` is the root of a git working tree.
pub fn is_repository(dir: &Path) -> bool {
    Repository::open(dir)
        .ok()
        .and_then(|repo| repo.workdir().map(|w| same_dir(w, dir)))
        .unwrap_or(false)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Clone a repository into the target directory.
///
/// The remote URL stored in `.git/config` will be the **plain** URL
/// (no credentials). Authentication is handled via credential callback only.
pub async fn clone(url: &str, target: &Path, token: Option<&str>) -> Result<()> {
    validate_clone_url(url)?;

    let url = url.to_string();
    let target = target.to_path_buf();
    let token = token.map(str::to_string);

    tokio::task::spawn_blocking(move || {
        let fetch_opts = make_fetch_options(token.as_deref());
        RepoBuilder::new()
            .fetch_options(fetch_opts)
            .clone(&url, &target)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Clone task panicked: {e}")))?
}

/// Fetch a remote branch into `refs/remotes/origin/<branch>`.
pub async fn fetch_branch(dir: &Path, branch_name: &str, token: Option<&str>) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();
    let token = token.map(str::to_string);

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("+refs/heads/{branch_name}:refs/remotes/origin/{branch_name}");
        let mut fetch_opts = make_fetch_options(token.as_deref());
        remote.fetch(&[&refspec], Some(&mut fetch_opts), None)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Fetch task panicked: {e}")))?
}

/// Point the local branch at the fetched remote tip and check it out,
/// discarding local changes left by a previous run.
pub async fn checkout_remote_branch(dir: &Path, branch_name: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;

        let remote_ref = format!("refs/remotes/origin/{branch_name}");
        let commit = repo.find_reference(&remote_ref)?.peel_to_commit()?;

        // Not `repo.branch(.., force)`: that refuses to move the current HEAD,
        // which is exactly the branch a re-run finds checked out.
        let local_ref = format!("refs/heads/{branch_name}");
        repo.reference(&local_ref, commit.id(), true, "fanout: reset to origin")?;

        let obj = repo.revparse_single(&local_ref)?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(&obj, Some(&mut checkout))?;
        repo.set_head(&local_ref)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Checkout task panicked: {e}")))?
}
