//! Ref resolution for code-host packages: tags, branches and commit
//! prefixes resolve to a pinned commit hash via `git ls-remote`.

use std::process::Stdio;

use esmforge_core::ForgeError;

pub const CODE_HOST_BASE: &str = "https://github.com";

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteRef {
  pub sha: String,
  pub name: String,
}

/// Resolve a ref spec (`""`/`HEAD`, tag, branch, or commit prefix) for
/// `owner/repo` to a full commit hash.
pub async fn resolve_ref(repo: &str, spec: &str) -> Result<String, ForgeError> {
  if spec.len() == 40 && spec.bytes().all(|b| b.is_ascii_hexdigit()) {
    return Ok(spec.to_ascii_lowercase());
  }
  let output = tokio::process::Command::new("git")
    .arg("ls-remote")
    .arg(format!("{CODE_HOST_BASE}/{repo}"))
    .stdin(Stdio::null())
    .output()
    .await
    .map_err(|err| ForgeError::upstream(format!("git ls-remote {repo}: {err}")))?;
  if !output.status.success() {
    return Err(ForgeError::upstream(format!(
      "git ls-remote {repo}: {}",
      String::from_utf8_lossy(&output.stderr).trim()
    )));
  }
  let refs = parse_ls_remote(&String::from_utf8_lossy(&output.stdout));
  select_ref(&refs, spec)
    .ok_or_else(|| ForgeError::not_found(format!("repository ref \"{repo}@{spec}\" not found")))
}

pub fn parse_ls_remote(output: &str) -> Vec<RemoteRef> {
  output
    .lines()
    .filter_map(|line| {
      let (sha, name) = line.split_once('\t')?;
      if sha.len() != 40 {
        return None;
      }
      Some(RemoteRef {
        sha: sha.to_string(),
        name: name.trim().to_string(),
      })
    })
    .collect()
}

pub fn select_ref(refs: &[RemoteRef], spec: &str) -> Option<String> {
  let lookup = |name: String| {
    refs
      .iter()
      .find(|r| r.name == name)
      .map(|r| r.sha.clone())
  };
  if spec.is_empty() || spec == "HEAD" {
    return lookup("HEAD".to_string());
  }
  // annotated tags publish a peeled `^{}` entry pointing at the commit
  lookup(format!("refs/tags/{spec}^{{}}"))
    .or_else(|| lookup(format!("refs/tags/{spec}")))
    .or_else(|| lookup(format!("refs/heads/{spec}")))
    .or_else(|| {
      if esmforge_core::is_commitish(spec) {
        refs
          .iter()
          .find(|r| r.sha.starts_with(spec))
          .map(|r| r.sha.clone())
      } else {
        None
      }
    })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  const LS_REMOTE: &str = "\
23f07cf0952c76eca1a76ab6a86a55d6dfe4db01\tHEAD\n\
23f07cf0952c76eca1a76ab6a86a55d6dfe4db01\trefs/heads/main\n\
8e0bf5b5a9b14a55bcd55bcde6f6f5e10f095a34\trefs/heads/next\n\
f3b24b12cfa0ac6a84ad5a27ec1ad3b1eb51a08f\trefs/tags/v1.2.0\n\
9d67e2e30a47c2e124bd31b8a4f8e839f4ffab30\trefs/tags/v1.3.0\n\
0db52b25cb11efd1eee6d54c36e112cf26eb7268\trefs/tags/v1.3.0^{}\n";

  #[test]
  fn parses_tab_separated_refs() {
    let refs = parse_ls_remote(LS_REMOTE);
    assert_eq!(refs.len(), 6);
    assert_eq!(refs[0].name, "HEAD");
    assert!(parse_ls_remote("garbage\nno tabs here\n").is_empty());
  }

  #[test]
  fn selects_head_branches_and_tags() {
    let refs = parse_ls_remote(LS_REMOTE);
    assert_eq!(
      select_ref(&refs, "").as_deref(),
      Some("23f07cf0952c76eca1a76ab6a86a55d6dfe4db01")
    );
    assert_eq!(
      select_ref(&refs, "next").as_deref(),
      Some("8e0bf5b5a9b14a55bcd55bcde6f6f5e10f095a34")
    );
    assert_eq!(
      select_ref(&refs, "v1.2.0").as_deref(),
      Some("f3b24b12cfa0ac6a84ad5a27ec1ad3b1eb51a08f")
    );
  }

  #[test]
  fn peeled_tags_win_over_annotated_objects() {
    let refs = parse_ls_remote(LS_REMOTE);
    assert_eq!(
      select_ref(&refs, "v1.3.0").as_deref(),
      Some("0db52b25cb11efd1eee6d54c36e112cf26eb7268")
    );
  }

  #[test]
  fn commit_prefixes_match_shas() {
    let refs = parse_ls_remote(LS_REMOTE);
    assert_eq!(
      select_ref(&refs, "8e0bf5b").as_deref(),
      Some("8e0bf5b5a9b14a55bcd55bcde6f6f5e10f095a34")
    );
    assert_eq!(select_ref(&refs, "deadbeef"), None);
    assert_eq!(select_ref(&refs, "not-a-ref"), None);
  }
}
