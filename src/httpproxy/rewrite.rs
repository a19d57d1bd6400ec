/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use once_cell::sync::Lazy;
use regex::Regex;

/// One path-rewriting rule: a pattern with capture groups and an expansion
/// template (`$1`, `$2`, ...). Rules are evaluated in declaration order and
/// the first match wins.
pub struct RewriteRule {
    pattern: Regex,
    template: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, template: &str) -> Result<Self, regex::Error> {
        Ok(RewriteRule {
            pattern: Regex::new(pattern)?,
            template: template.to_string(),
        })
    }
}

/// Ordered list of [`RewriteRule`]s applied to inbound request paths.
pub struct Rewriter {
    rules: Vec<RewriteRule>,
}

impl Rewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Rewriter { rules }
    }

    /// Applies the first matching rule and returns the rewritten
    /// path-and-query, or `None` when no rule matches.
    pub fn rewrite(&self, path: &str) -> Option<String> {
        for rule in &self.rules {
            if rule.pattern.is_match(path) {
                return Some(
                    rule.pattern
                        .replace(path, rule.template.as_str())
                        .into_owned(),
                );
            }
        }
        None
    }
}

/// One cache-key extraction rule, same shape as a rewrite rule but the
/// expansion produces a cache key instead of a path.
pub struct CacheRule {
    pattern: Regex,
    template: String,
}

impl CacheRule {
    pub fn new(pattern: &str, template: &str) -> Result<Self, regex::Error> {
        Ok(CacheRule {
            pattern: Regex::new(pattern)?,
            template: template.to_string(),
        })
    }

    fn extract(&self, path: &str) -> Option<String> {
        if self.pattern.is_match(path) {
            return Some(
                self.pattern
                    .replace(path, self.template.as_str())
                    .into_owned(),
            );
        }
        None
    }
}

/// Derives a cache key from a request path using the first matching rule.
pub fn extract_key(rules: &[CacheRule], path: &str) -> Option<String> {
    rules.iter().find_map(|rule| rule.extract(path))
}

// bootloader artifacts requested by firmware at well-known bare names, each
// mapped to its canonical location under boot-resources
const BOOTLOADERS: &[(&str, &str)] = &[
    ("bootx64.efi", "uefi/amd64"),
    ("grubx64.efi", "uefi/amd64"),
    ("bootaa64.efi", "uefi/arm64"),
    ("grubaa64.efi", "uefi/arm64"),
    ("bootppc64.bin", "open-firmware/ppc64el"),
    ("lpxelinux.0", "pxe/i386"),
    ("chain.c32", "pxe/i386"),
    ("ifcpu64.c32", "pxe/i386"),
    ("ldlinux.c32", "pxe/i386"),
    ("libcom32.c32", "pxe/i386"),
    ("libutil.c32", "pxe/i386"),
];

/// Rewrite rules for the boot-resource domain: bare bootloader names are
/// pinned to their bootloader directories and legacy `/images/` paths are
/// redirected to `/boot-resources/`.
pub static BOOT_RESOURCE_REWRITE_RULES: Lazy<Vec<RewriteRule>> = Lazy::new(|| {
    let mut rules = Vec::new();
    for (name, arch_dir) in BOOTLOADERS {
        let pattern = format!("^.*/{}$", regex::escape(name));
        let template = format!("/boot-resources/bootloaders/{arch_dir}/{name}");
        rules.push(
            RewriteRule::new(&pattern, &template)
                .unwrap_or_else(|e| panic!("bad bootloader rewrite rule: {e}")),
        );
    }
    rules.push(
        RewriteRule::new("^/images/(.*)$", "/boot-resources/$1")
            .unwrap_or_else(|e| panic!("bad images rewrite rule: {e}")),
    );
    rules
});

/// Cache-key rules for the boot-resource domain: content is addressed by the
/// 64-hex-character hash embedded in the path.
pub static BOOT_RESOURCE_CACHE_RULES: Lazy<Vec<CacheRule>> = Lazy::new(|| {
    vec![
        CacheRule::new("^/boot-resources/([0-9a-f]{64})$", "$1")
            .unwrap_or_else(|e| panic!("bad cache rule: {e}")),
        CacheRule::new("^/boot-resources/([0-9a-f]{64})/.*$", "$1")
            .unwrap_or_else(|e| panic!("bad cache rule: {e}")),
    ]
});

pub fn boot_resource_rewriter() -> Rewriter {
    let rules = BOOT_RESOURCE_REWRITE_RULES
        .iter()
        .map(|r| RewriteRule {
            pattern: r.pattern.clone(),
            template: r.template.clone(),
        })
        .collect();
    Rewriter::new(rules)
}

pub fn boot_resource_cache_rules() -> Vec<CacheRule> {
    BOOT_RESOURCE_CACHE_RULES
        .iter()
        .map(|r| CacheRule {
            pattern: r.pattern.clone(),
            template: r.template.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let rewriter = Rewriter::new(vec![
            RewriteRule::new("^/a/(.*)$", "/first/$1").unwrap(),
            RewriteRule::new("^/a/(.*)$", "/second/$1").unwrap(),
        ]);
        assert_eq!(rewriter.rewrite("/a/x").unwrap(), "/first/x");
    }

    #[test]
    fn no_match_returns_none() {
        let rewriter = Rewriter::new(vec![RewriteRule::new("^/a/(.*)$", "/x/$1").unwrap()]);
        assert!(rewriter.rewrite("/other").is_none());
    }

    #[test]
    fn bootloader_names_map_to_canonical_paths() {
        let rewriter = boot_resource_rewriter();
        assert_eq!(
            rewriter.rewrite("/some/dir/bootx64.efi").unwrap(),
            "/boot-resources/bootloaders/uefi/amd64/bootx64.efi"
        );
        assert_eq!(
            rewriter.rewrite("/x/lpxelinux.0").unwrap(),
            "/boot-resources/bootloaders/pxe/i386/lpxelinux.0"
        );
        assert_eq!(
            rewriter.rewrite("/ppc/bootppc64.bin").unwrap(),
            "/boot-resources/bootloaders/open-firmware/ppc64el/bootppc64.bin"
        );
    }

    #[test]
    fn images_paths_move_to_boot_resources() {
        let rewriter = boot_resource_rewriter();
        assert_eq!(
            rewriter.rewrite("/images/ubuntu/amd64/ga-24.04/squashfs").unwrap(),
            "/boot-resources/ubuntu/amd64/ga-24.04/squashfs"
        );
    }

    #[test]
    fn cache_rules_extract_content_hashes() {
        let rules = boot_resource_cache_rules();
        let hash = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(
            extract_key(&rules, &format!("/boot-resources/{hash}")).unwrap(),
            hash
        );
        assert_eq!(
            extract_key(&rules, &format!("/boot-resources/{hash}/root.squashfs")).unwrap(),
            hash
        );
        assert!(extract_key(&rules, "/boot-resources/not-a-hash").is_none());
    }
}
