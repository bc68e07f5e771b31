use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

/// The ECMAScript level (or runtime) a build is compiled for.
///
/// Targets partition the artefact store: the same package/version/args tuple
/// produces one artefact per target.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
  #[default]
  Es2015,
  Es2016,
  Es2017,
  Es2018,
  Es2019,
  Es2020,
  Es2021,
  Es2022,
  EsNext,
  Deno,
  DenoNext,
  Node,
}

impl Target {
  pub const ALL: [Target; 12] = [
    Target::Es2015,
    Target::Es2016,
    Target::Es2017,
    Target::Es2018,
    Target::Es2019,
    Target::Es2020,
    Target::Es2021,
    Target::Es2022,
    Target::EsNext,
    Target::Deno,
    Target::DenoNext,
    Target::Node,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Target::Es2015 => "es2015",
      Target::Es2016 => "es2016",
      Target::Es2017 => "es2017",
      Target::Es2018 => "es2018",
      Target::Es2019 => "es2019",
      Target::Es2020 => "es2020",
      Target::Es2021 => "es2021",
      Target::Es2022 => "es2022",
      Target::EsNext => "esnext",
      Target::Deno => "deno",
      Target::DenoNext => "denonext",
      Target::Node => "node",
    }
  }

  /// Server-side runtimes get `platform = node` and real `node:` builtins.
  pub fn is_server(&self) -> bool {
    matches!(self, Target::Node | Target::Deno | Target::DenoNext)
  }

  pub fn is_deno(&self) -> bool {
    matches!(self, Target::Deno | Target::DenoNext)
  }

  /// Whether the emitted code may use `??` (es2020 and up, and all runtimes).
  pub fn supports_nullish_coalescing(&self) -> bool {
    !matches!(
      self,
      Target::Es2015 | Target::Es2016 | Target::Es2017 | Target::Es2018 | Target::Es2019
    )
  }
}

impl Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Target {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Target::ALL
      .iter()
      .find(|t| t.as_str() == s)
      .copied()
      .ok_or(())
  }
}

static CHROME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:Chrome|Chromium|CriOS)/(\d+)").unwrap());
static FIREFOX: Lazy<Regex> = Lazy::new(|| Regex::new(r"Firefox/(\d+)").unwrap());
static SAFARI: Lazy<Regex> = Lazy::new(|| Regex::new(r"Version/(\d+)[\.\d]* .*Safari/").unwrap());
static DENO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Deno/(\d+)\.(\d+)\.(\d+)").unwrap());

/// Infer the build target from a `User-Agent` header.
///
/// This table is the single externally visible piece of non-determinism in
/// URL handling; responses derived from it must carry `Vary: User-Agent`.
/// Unknown agents get the weakest target.
pub fn target_from_ua(ua: &str) -> Target {
  if let Some(caps) = DENO.captures(ua) {
    let parse = |i| {
      caps
        .get(i)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0)
    };
    // `node:` builtin support landed in 1.33.2
    let version = (parse(1), parse(2), parse(3));
    return if version >= (1, 33, 2) {
      Target::DenoNext
    } else {
      Target::Deno
    };
  }
  if ua == "undici" || ua.starts_with("Node/") || ua.starts_with("Node.js/") || ua.starts_with("Bun/") {
    return Target::Node;
  }
  if let Some(major) = capture_major(&CHROME, ua) {
    return match major {
      94.. => Target::Es2022,
      91.. => Target::Es2021,
      80.. => Target::Es2020,
      73.. => Target::Es2019,
      63.. => Target::Es2018,
      58.. => Target::Es2017,
      51.. => Target::Es2016,
      _ => Target::Es2015,
    };
  }
  if let Some(major) = capture_major(&FIREFOX, ua) {
    return match major {
      93.. => Target::Es2022,
      90.. => Target::Es2021,
      74.. => Target::Es2020,
      64.. => Target::Es2019,
      58.. => Target::Es2018,
      53.. => Target::Es2017,
      52.. => Target::Es2016,
      _ => Target::Es2015,
    };
  }
  if let Some(major) = capture_major(&SAFARI, ua) {
    return match major {
      15.. => Target::Es2021,
      14.. => Target::Es2020,
      12.. => Target::Es2019,
      11.. => Target::Es2017,
      10.. => Target::Es2016,
      _ => Target::Es2015,
    };
  }
  Target::Es2015
}

fn capture_major(re: &Regex, ua: &str) -> Option<u64> {
  re.captures(ua)
    .and_then(|caps| caps.get(1))
    .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn round_trips_names() {
    for target in Target::ALL {
      assert_eq!(target.as_str().parse::<Target>().unwrap(), target);
    }
    assert!("es9999".parse::<Target>().is_err());
  }

  #[test]
  fn infers_browser_targets() {
    let chrome = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36";
    assert_eq!(target_from_ua(chrome), Target::Es2022);

    let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:88.0) Gecko/20100101 Firefox/88.0";
    assert_eq!(target_from_ua(firefox), Target::Es2020);

    let safari = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                  (KHTML, like Gecko) Version/14.1.2 Safari/605.1.15";
    assert_eq!(target_from_ua(safari), Target::Es2020);
  }

  #[test]
  fn infers_runtime_targets() {
    assert_eq!(target_from_ua("Deno/1.30.0"), Target::Deno);
    assert_eq!(target_from_ua("Deno/1.40.2"), Target::DenoNext);
    assert_eq!(target_from_ua("Node/18.16.0"), Target::Node);
    assert_eq!(target_from_ua("Bun/1.0.0"), Target::Node);
    assert_eq!(target_from_ua("undici"), Target::Node);
  }

  #[test]
  fn falls_back_to_weakest_target() {
    assert_eq!(target_from_ua("curl/8.0.1"), Target::Es2015);
    assert_eq!(target_from_ua(""), Target::Es2015);
  }
}
