//! Codec for the args prefix: the `X-<base64url>` URL segment that carries
//! build modifiers inside canonical artefact URLs.
//!
//! The decoded payload is a `;`-separated list of `key:value` entries written
//! in a fixed key order with sorted set values, so encoding is a pure
//! function of the logical arguments and `decode(encode(args)) == args`
//! after normalization.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::ForgeError;
use crate::types::is_full_version;
use crate::types::BuildArgs;
use crate::types::Pkg;

/// Encode build args into the bare base64 payload (no `X-` prefix).
/// Returns an empty string when every field is empty after normalization
/// against the host package.
pub fn encode_args_prefix(args: &BuildArgs, host: &Pkg, for_types: bool) -> String {
  let mut args = args.clone();
  args.normalize(host);

  let mut entries: Vec<String> = Vec::new();

  if !args.alias.is_empty() {
    let pairs: Vec<String> = args
      .alias
      .iter()
      .map(|(name, to)| format!("{name}:{to}"))
      .collect();
    entries.push(format!("a:{}", pairs.join(",")));
  }
  if !args.deps.is_empty() {
    let deps: Vec<String> = args
      .deps
      .iter()
      .map(|d| format!("{}@{}", flatten_scope(&d.name), d.version))
      .collect();
    entries.push(format!("d:{}", deps.join(",")));
  }
  if !args.external.is_empty() {
    let external: Vec<&str> = args.external.iter().map(String::as_str).collect();
    entries.push(format!("e:{}", external.join(",")));
  }
  if !for_types {
    if !args.exports.is_empty() {
      let exports: Vec<&str> = args.exports.iter().map(String::as_str).collect();
      entries.push(format!("x:{}", exports.join(",")));
    }
    if !args.conditions.is_empty() {
      let conditions: Vec<&str> = args.conditions.iter().map(String::as_str).collect();
      entries.push(format!("c:{}", conditions.join(",")));
    }
    if let Some(jsx) = &args.jsx_runtime {
      entries.push(format!("j:{}@{}", flatten_scope(&jsx.name), jsx.version));
    }
    let mut flags: Vec<&str> = Vec::new();
    if args.external_require {
      flags.push("er");
    }
    if args.keep_names {
      flags.push("kn");
    }
    if args.ignore_annotations {
      flags.push("ia");
    }
    if !flags.is_empty() {
      entries.push(format!("f:{}", flags.join(",")));
    }
  }

  if entries.is_empty() {
    return String::new();
  }
  URL_SAFE_NO_PAD.encode(entries.join(";"))
}

/// Decode the bare base64 payload of an args prefix (without `X-`).
/// Unknown keys and malformed entries are rejected.
pub fn decode_args_prefix(encoded: &str) -> Result<BuildArgs, ForgeError> {
  let bytes = URL_SAFE_NO_PAD
    .decode(encoded)
    .map_err(|_| ForgeError::invalid_request("invalid args prefix"))?;
  let payload = String::from_utf8(bytes)
    .map_err(|_| ForgeError::invalid_request("invalid args prefix"))?;

  let mut args = BuildArgs::default();
  for entry in payload.split(';') {
    let (key, value) = entry
      .split_once(':')
      .ok_or_else(|| ForgeError::invalid_request("invalid args prefix"))?;
    match key {
      "a" => {
        for pair in value.split(',') {
          let (name, to) = pair
            .split_once(':')
            .ok_or_else(|| ForgeError::invalid_request("invalid alias in args prefix"))?;
          if name.is_empty() || to.is_empty() {
            return Err(ForgeError::invalid_request("invalid alias in args prefix"));
          }
          args.alias.insert(name.to_string(), to.to_string());
        }
      }
      "d" => {
        for dep in value.split(',') {
          args.add_dep(parse_pinned(dep)?);
        }
      }
      "e" => {
        args.external = value.split(',').map(str::to_string).collect();
      }
      "x" => {
        args.exports = value.split(',').map(str::to_string).collect();
      }
      "c" => {
        args.conditions = value.split(',').map(str::to_string).collect();
      }
      "j" => {
        args.jsx_runtime = Some(parse_pinned(value)?);
      }
      "f" => {
        for flag in value.split(',') {
          match flag {
            "er" => args.external_require = true,
            "kn" => args.keep_names = true,
            "ia" => args.ignore_annotations = true,
            _ => {
              return Err(ForgeError::invalid_request(format!(
                "unknown flag '{flag}' in args prefix"
              )))
            }
          }
        }
      }
      _ => {
        return Err(ForgeError::invalid_request(format!(
          "unknown key '{key}' in args prefix"
        )))
      }
    }
  }
  Ok(args)
}

/// `@scope/name` flattens to `@scope_name` so dep entries stay `/`-free
/// inside a URL path segment.
fn flatten_scope(name: &str) -> String {
  match name.strip_prefix('@') {
    Some(rest) => format!("@{}", rest.replacen('/', "_", 1)),
    None => name.to_string(),
  }
}

fn restore_scope(name: &str) -> String {
  match name.strip_prefix('@') {
    Some(rest) => format!("@{}", rest.replacen('_', "/", 1)),
    None => name.to_string(),
  }
}

fn parse_pinned(s: &str) -> Result<Pkg, ForgeError> {
  if s.is_empty() {
    return Err(ForgeError::invalid_request("empty dep in args prefix"));
  }
  let split_at = s[1..]
    .rfind('@')
    .map(|i| i + 1)
    .ok_or_else(|| ForgeError::invalid_request(format!("unpinned dep '{s}' in args prefix")))?;
  let name = restore_scope(&s[..split_at]);
  let version = &s[split_at + 1..];
  if name.is_empty() || !is_full_version(version) {
    return Err(ForgeError::invalid_request(format!(
      "unpinned dep '{s}' in args prefix"
    )));
  }
  Ok(Pkg::new(name, version))
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn sample_args() -> BuildArgs {
    let mut args = BuildArgs::default();
    args.alias.insert("a".into(), "b".into());
    args.add_dep(Pkg::new("c", "1.0.0"));
    args.add_dep(Pkg::new("d", "1.0.0"));
    args.add_dep(Pkg::new("e", "1.0.0"));
    args.add_dep(Pkg::new("foo", "1.0.0")); // host pin, dropped by encode
    args.external.insert("baz".into());
    args.external.insert("bar".into());
    args.exports.insert("baz".into());
    args.exports.insert("bar".into());
    args.conditions.insert("react-server".into());
    args.jsx_runtime = Some(Pkg::new("react", "18.2.0"));
    args.external_require = true;
    args.keep_names = true;
    args.ignore_annotations = true;
    args
  }

  #[test]
  fn round_trips_after_normalization() {
    let host = Pkg::new("foo", "1.0.0");
    let encoded = encode_args_prefix(&sample_args(), &host, false);
    let decoded = decode_args_prefix(&encoded).unwrap();

    assert_eq!(decoded.alias.len(), 1);
    assert_eq!(decoded.alias["a"], "b");
    assert_eq!(decoded.deps.len(), 3);
    assert_eq!(decoded.external.len(), 2);
    assert_eq!(decoded.exports.len(), 2);
    assert_eq!(
      decoded.conditions.iter().collect::<Vec<_>>(),
      vec!["react-server"]
    );
    assert_eq!(decoded.jsx_runtime.unwrap().to_string(), "react@18.2.0");
    assert!(decoded.external_require);
    assert!(decoded.keep_names);
    assert!(decoded.ignore_annotations);
  }

  #[test]
  fn encoding_is_order_independent() {
    let host = Pkg::new("foo", "1.0.0");
    let mut reordered = BuildArgs::default();
    reordered.external.insert("bar".into());
    reordered.external.insert("baz".into());
    let mut other = BuildArgs::default();
    other.external.insert("baz".into());
    other.external.insert("bar".into());
    assert_eq!(
      encode_args_prefix(&reordered, &host, false),
      encode_args_prefix(&other, &host, false)
    );
  }

  #[test]
  fn empty_args_encode_to_empty_string() {
    let host = Pkg::new("foo", "1.0.0");
    assert_eq!(encode_args_prefix(&BuildArgs::default(), &host, false), "");

    // a lone host pin normalizes away entirely
    let mut args = BuildArgs::default();
    args.add_dep(Pkg::new("foo", "1.0.0"));
    assert_eq!(encode_args_prefix(&args, &host, false), "");
  }

  #[test]
  fn types_variant_drops_build_only_fields() {
    let host = Pkg::new("foo", "1.0.0");
    let encoded = encode_args_prefix(&sample_args(), &host, true);
    let decoded = decode_args_prefix(&encoded).unwrap();
    assert!(decoded.exports.is_empty());
    assert!(decoded.conditions.is_empty());
    assert!(decoded.jsx_runtime.is_none());
    assert!(!decoded.keep_names);
    assert_eq!(decoded.deps.len(), 3);
  }

  #[test]
  fn scoped_deps_survive_the_flattening() {
    let host = Pkg::new("foo", "1.0.0");
    let mut args = BuildArgs::default();
    args.add_dep(Pkg::new("@emotion/react", "11.10.6"));
    let decoded = decode_args_prefix(&encode_args_prefix(&args, &host, false)).unwrap();
    assert_eq!(decoded.deps[0].name, "@emotion/react");
    assert_eq!(decoded.deps[0].version, "11.10.6");
  }

  #[test]
  fn rejects_unknown_keys() {
    let payload = URL_SAFE_NO_PAD.encode("z:nope");
    assert!(decode_args_prefix(&payload).is_err());
    assert!(decode_args_prefix("!!!").is_err());
  }
}
