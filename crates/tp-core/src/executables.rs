use crate::config::Config;
use crate::consts::*;
use crate::error::Error;
use crate::exec::{CommandOutput, exec_cmd};
use crate::logger::Logger;
use anyhow::{Context, Result};
use regex::Regex;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use tp_netns::SandboxConfig;

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ip6?tables(?:-\w+)? v(\d+\.\d+(?:\.\d+)?)(?:\s+\((\w+)\))?")
        .expect("valid version regex")
});

static DOCKER_OUTPUT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^:DOCKER_OUTPUT").expect("valid chain regex"));

const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

const PROBED_MODULES: &[&str] = &["owner", "tcp", "udp", "comment", "conntrack"];

/// What a binary of a flavor does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Save,
    Restore,
}

impl Operation {
    fn suffix(self) -> &'static str {
        match self {
            Operation::Apply => "",
            Operation::Save => "save",
            Operation::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid iptables version string: '{}'", s))?;

        match parts.as_slice() {
            [major, minor] => Ok(Self {
                major: *major,
                minor: *minor,
                patch: 0,
            }),
            [major, minor, patch] => Ok(Self {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => anyhow::bail!("invalid iptables version string: '{}'", s),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome of a `--version` probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProbe {
    pub mode: IptablesMode,
    /// Absent for binaries too old to understand `--version`.
    pub version: Option<Version>,
}

/// A binary that still has to be located, e.g. `ip6tables-legacy-save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executable {
    pub family: IpFamily,
    pub mode: IptablesMode,
    pub operation: Operation,
}

impl Executable {
    pub fn new(family: IpFamily, mode: IptablesMode, operation: Operation) -> Self {
        Self {
            family,
            mode,
            operation,
        }
    }

    pub fn name_with_mode(&self) -> String {
        join_non_empty(&[
            self.family.command_prefix(),
            self.mode.as_str(),
            self.operation.suffix(),
        ])
    }

    pub fn name_without_mode(&self) -> String {
        join_non_empty(&[self.family.command_prefix(), self.operation.suffix()])
    }

    /// Candidates in lookup order: the flavored name via PATH, then in each
    /// fallback directory, then the same for the unflavored name.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for name in [self.name_with_mode(), self.name_without_mode()] {
            paths.push(PathBuf::from(&name));
            for location in FALLBACK_EXECUTABLE_LOCATIONS {
                paths.push(Path::new(location).join(&name));
            }
        }
        paths
    }

    pub async fn initialize(
        &self,
        args: Vec<String>,
        sandbox: Option<SandboxConfig>,
    ) -> Result<InitializedExecutable> {
        for candidate in self.search_paths() {
            let Some(found) = find_path(&candidate) else {
                continue;
            };

            match probe_version(&found).await {
                Ok(probe) if probe.mode == self.mode => {
                    tracing::debug!(
                        "found {} at {} (version {})",
                        self.name_with_mode(),
                        found.display(),
                        probe
                            .version
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                    return Ok(InitializedExecutable {
                        name: self.name_with_mode(),
                        path: found,
                        mode: self.mode,
                        version: probe.version,
                        args,
                        sandbox,
                    });
                }
                Ok(probe) => {
                    tracing::debug!(
                        "{} is a {} binary, looking for {}",
                        found.display(),
                        probe.mode,
                        self.mode
                    );
                }
                Err(err) => {
                    tracing::debug!("skipping {}: {:#}", found.display(), err);
                }
            }
        }

        Err(Error::ExecutableNotFound {
            name: self.name_with_mode(),
        }
        .into())
    }
}

/// A located binary bound to its flavor and default arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedExecutable {
    pub name: String,
    pub path: PathBuf,
    pub mode: IptablesMode,
    pub version: Option<Version>,
    /// Prepended to every invocation.
    pub args: Vec<String>,
    pub sandbox: Option<SandboxConfig>,
}

impl InitializedExecutable {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, mode: IptablesMode) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mode,
            version: None,
            args: vec![],
            sandbox: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub async fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut all = self.args.clone();
        all.extend(args.iter().map(|a| a.to_string()));
        exec_cmd(&self.path, &all, self.sandbox.as_ref()).await
    }

    /// Command line as it would be run, for logs.
    pub fn command_line(&self, args: &[&str]) -> String {
        let mut parts = vec![self.path.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    pub nat: bool,
    pub raw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modules {
    pub owner: bool,
    pub tcp: bool,
    pub udp: bool,
    pub comment: bool,
    pub conntrack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chains {
    pub docker_output: bool,
    /// The live nat table already holds user-defined chains.
    pub custom: bool,
}

/// Kernel and binary capabilities observed for one flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Functionality {
    pub tables: Tables,
    pub modules: Modules,
    pub chains: Chains,
}

impl Functionality {
    /// Everything present, nothing pre-existing.
    pub fn assumed() -> Self {
        Self {
            tables: Tables {
                nat: true,
                raw: true,
            },
            modules: Modules {
                owner: true,
                tcp: true,
                udp: true,
                comment: true,
                conntrack: true,
            },
            chains: Chains::default(),
        }
    }

    pub fn verify_minimal_requirements(&self) -> Result<(), Error> {
        let mut missing = Vec::new();
        if !self.tables.nat {
            missing.push("table nat".to_string());
        }
        if !self.modules.tcp {
            missing.push("module tcp".to_string());
        }
        if !self.modules.owner {
            missing.push("module owner".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::UnmetRequirements { missing })
        }
    }

    fn set_module(&mut self, module: &str, present: bool) {
        match module {
            "owner" => self.modules.owner = present,
            "tcp" => self.modules.tcp = present,
            "udp" => self.modules.udp = present,
            "comment" => self.modules.comment = present,
            "conntrack" => self.modules.conntrack = present,
            _ => {}
        }
    }
}

/// Probe tables and match modules with no-op invocations.
pub async fn verify_functionality(
    iptables: &InitializedExecutable,
    save: &InitializedExecutable,
) -> Functionality {
    let mut functionality = Functionality::default();

    match save.exec(&["-t", "nat"]).await {
        Ok(output) => {
            functionality.tables.nat = true;
            functionality.chains = chains_from_save_output(&output.stdout);
        }
        Err(err) => tracing::debug!("table nat unavailable for {}: {:#}", save.name, err),
    }

    functionality.tables.raw = save.exec(&["-t", "raw"]).await.is_ok();

    for module in PROBED_MODULES {
        let present = iptables.exec(&["-m", module, "--help"]).await.is_ok();
        if !present {
            tracing::debug!("match module {} unavailable for {}", module, iptables.name);
        }
        functionality.set_module(module, present);
    }

    functionality
}

pub fn chains_from_save_output(output: &str) -> Chains {
    let custom = output
        .lines()
        .filter_map(|line| line.strip_prefix(':'))
        .filter_map(|decl| decl.split_whitespace().next())
        .any(|name| !BUILTIN_CHAINS.contains(&name) && name != CHAIN_DOCKER_OUTPUT);

    Chains {
        docker_output: DOCKER_OUTPUT_REGEX.is_match(output),
        custom,
    }
}

/// The apply/save/restore trio of one flavor and address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedExecutables {
    pub family: IpFamily,
    pub mode: IptablesMode,
    pub iptables: InitializedExecutable,
    pub save: InitializedExecutable,
    pub restore: InitializedExecutable,
    pub functionality: Functionality,
}

impl InitializedExecutables {
    /// Stand-in used when nothing could be resolved but nothing will run
    /// either (dry-run, eBPF mode).
    pub fn assumed(family: IpFamily, mode: IptablesMode) -> Self {
        let executable = |operation| {
            let exe = Executable::new(family, mode, operation);
            InitializedExecutable::new(exe.name_with_mode(), exe.name_with_mode(), mode)
        };

        Self {
            family,
            mode,
            iptables: executable(Operation::Apply),
            save: executable(Operation::Save),
            restore: executable(Operation::Restore),
            functionality: Functionality::assumed(),
        }
    }

    /// Name stem for temporary rule files, e.g. `ip6tables-rules`.
    pub fn rules_file_prefix(&self) -> String {
        format!("{}-rules", self.family.command_prefix())
    }

    pub fn has_docker_output_chain(&self) -> bool {
        self.functionality.chains.docker_output
    }

    pub fn has_custom_chains(&self) -> bool {
        self.functionality.chains.custom
    }
}

/// Default restore arguments: only legacy binaries take the lock flags.
pub fn build_restore_args(cfg: &Config, mode: IptablesMode) -> Vec<String> {
    let mut flags = Vec::new();
    if mode != IptablesMode::Legacy {
        return flags;
    }
    if cfg.wait > 0 {
        flags.push(format!("{}={}", FLAG_WAIT, cfg.wait));
    }
    if cfg.wait_interval > 0 {
        flags.push(format!("{}={}", FLAG_WAIT_INTERVAL, cfg.wait_interval));
    }
    flags
}

/// Locate and verify all binaries of one flavor.
pub async fn initialize_executables(
    family: IpFamily,
    mode: IptablesMode,
    cfg: &Config,
) -> Result<InitializedExecutables> {
    let sandbox = cfg
        .cni
        .as_ref()
        .map(|cni| SandboxConfig::new(cni.netns_path.clone()));

    let iptables = Executable::new(family, mode, Operation::Apply)
        .initialize(vec![], sandbox.clone())
        .await;
    let save = Executable::new(family, mode, Operation::Save)
        .initialize(vec![], sandbox.clone())
        .await;
    let restore = Executable::new(family, mode, Operation::Restore)
        .initialize(build_restore_args(cfg, mode), sandbox)
        .await;

    let (iptables, save, restore) = match (iptables, save, restore) {
        (Ok(iptables), Ok(save), Ok(restore)) => (iptables, save, restore),
        (iptables, save, restore) => {
            let errors: Vec<String> = [iptables.err(), save.err(), restore.err()]
                .into_iter()
                .flatten()
                .map(|e| format!("{:#}", e))
                .collect();
            anyhow::bail!(
                "failed to initialize {} {} executables: {}",
                family,
                mode,
                errors.join("; ")
            );
        }
    };

    let functionality = verify_functionality(&iptables, &save).await;
    functionality
        .verify_minimal_requirements()
        .with_context(|| format!("{} {} executables are not usable", family, mode))?;

    Ok(InitializedExecutables {
        family,
        mode,
        iptables,
        save,
        restore,
        functionality,
    })
}

/// Resolve both flavors and pick one.
pub async fn resolve_executables(
    family: IpFamily,
    cfg: &Config,
    logger: &Logger,
) -> Result<InitializedExecutables> {
    let nft = initialize_executables(family, IptablesMode::Nft, cfg).await;
    let legacy = initialize_executables(family, IptablesMode::Legacy, cfg).await;
    select_flavor(family, nft, legacy, cfg.dry_run, logger)
}

/// Flavor decision:
/// 1. neither works: error, or an assumed nft set in dry-run
/// 2. only one works: that one
/// 3. both have DOCKER_OUTPUT: nft, with a warning
/// 4. only legacy has DOCKER_OUTPUT, or only legacy has custom chains: legacy
/// 5. otherwise nft (warning when both already have custom chains)
pub fn select_flavor(
    family: IpFamily,
    nft: Result<InitializedExecutables>,
    legacy: Result<InitializedExecutables>,
    dry_run: bool,
    logger: &Logger,
) -> Result<InitializedExecutables> {
    let (nft, legacy) = match (nft, legacy) {
        (Err(nft_err), Err(legacy_err)) => {
            if dry_run {
                logger.warn(format!(
                    "dry-run mode: no valid {} iptables executables found. The generated \
                     rules may differ from those generated in an environment with valid \
                     iptables executables",
                    family
                ));
                return Ok(InitializedExecutables::assumed(family, IptablesMode::Nft));
            }
            return Err(nft_err.context(format!(
                "failed to find valid nft or legacy {} executables (legacy: {:#})",
                family, legacy_err
            )));
        }
        (Ok(nft), Err(err)) => {
            tracing::debug!("legacy {} executables unavailable: {:#}", family, err);
            return Ok(nft);
        }
        (Err(err), Ok(legacy)) => {
            tracing::debug!("nft {} executables unavailable: {:#}", family, err);
            return Ok(legacy);
        }
        (Ok(nft), Ok(legacy)) => (nft, legacy),
    };

    if nft.has_docker_output_chain() && legacy.has_docker_output_chain() {
        logger.warn(
            "conflicting iptables modes detected. Both iptables-nft and iptables-legacy \
             contain a nat table with a chain named 'DOCKER_OUTPUT'. iptables-legacy will be \
             ignored and iptables-nft will be used",
        );
        return Ok(nft);
    }

    if legacy.has_docker_output_chain() && !nft.has_docker_output_chain() {
        return Ok(legacy);
    }

    match (nft.has_custom_chains(), legacy.has_custom_chains()) {
        (false, true) => Ok(legacy),
        (true, true) => {
            logger.warn(
                "both iptables-nft and iptables-legacy contain custom chains in the nat \
                 table. iptables-nft will be used",
            );
            Ok(nft)
        }
        _ => Ok(nft),
    }
}

/// Run `--version` and classify the binary.
pub async fn probe_version(path: &Path) -> Result<VersionProbe> {
    let legacy_without_version = VersionProbe {
        mode: IptablesMode::Legacy,
        version: None,
    };

    match exec_cmd(path, &[FLAG_VERSION.to_string()], None).await {
        Err(err) => {
            let message = format!("{:#}", err);
            if is_version_flag_missing(&message) {
                Ok(legacy_without_version)
            } else {
                Err(format_version_error(&message))
            }
        }
        Ok(output) if is_version_flag_missing(&output.stderr) => Ok(legacy_without_version),
        Ok(output) => parse_version_output(&output.stdout),
    }
}

pub fn parse_version_output(stdout: &str) -> Result<VersionProbe> {
    let captures = VERSION_REGEX
        .captures(stdout.trim_start())
        .ok_or_else(|| format_version_error(stdout))
        .context("unable to parse iptables version")?;

    let version: Version = captures[1]
        .parse()
        .map_err(|e: anyhow::Error| format_version_error(&e.to_string()))?;

    let mode = match captures.get(2) {
        None => IptablesMode::Legacy,
        Some(marker) => IptablesMode::from_version_marker(marker.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown iptables mode '{}'", marker.as_str()))?,
    };

    Ok(VersionProbe {
        mode,
        version: Some(version),
    })
}

fn is_version_flag_missing(output: &str) -> bool {
    output.contains(&format!("unrecognized option '{}'", FLAG_VERSION))
}

/// Collapse probe output into a single bounded line.
pub fn format_version_error(message: &str) -> anyhow::Error {
    let single_line = message.replace('\n', " ").replace("  ", " ");
    let trimmed = single_line.trim().trim_end_matches('.');

    if trimmed.chars().count() > 500 {
        let truncated: String = trimmed.chars().take(500).collect();
        anyhow::anyhow!("{}...", truncated)
    } else {
        anyhow::anyhow!("{}", trimmed)
    }
}

/// PATH lookup for bare names, an executable-file check for paths.
pub fn find_path(candidate: &Path) -> Option<PathBuf> {
    if candidate.components().count() > 1 {
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(candidate))
        .find(|full| is_executable_file(full))
        .map(|full| {
            if full.is_relative() {
                std::env::current_dir().map(|cwd| cwd.join(&full)).unwrap_or(full)
            } else {
                full
            }
        })
}

fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executables(mode: IptablesMode, docker_output: bool, custom: bool) -> InitializedExecutables {
        let mut exe = InitializedExecutables::assumed(IpFamily::V4, mode);
        exe.functionality.chains = Chains {
            docker_output,
            custom,
        };
        exe
    }

    fn select(
        nft: Result<InitializedExecutables>,
        legacy: Result<InitializedExecutables>,
        dry_run: bool,
    ) -> Result<InitializedExecutables> {
        select_flavor(IpFamily::V4, nft, legacy, dry_run, &Logger::default())
    }

    #[test]
    fn test_executable_names() {
        let exe = Executable::new(IpFamily::V6, IptablesMode::Legacy, Operation::Save);
        assert_eq!(exe.name_with_mode(), "ip6tables-legacy-save");
        assert_eq!(exe.name_without_mode(), "ip6tables-save");

        let exe = Executable::new(IpFamily::V4, IptablesMode::Nft, Operation::Apply);
        assert_eq!(exe.name_with_mode(), "iptables-nft");
        assert_eq!(exe.name_without_mode(), "iptables");
    }

    #[test]
    fn test_search_paths_order() {
        let exe = Executable::new(IpFamily::V4, IptablesMode::Nft, Operation::Restore);
        let paths: Vec<String> = exe
            .search_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        assert_eq!(paths.len(), 10);
        assert_eq!(paths[0], "iptables-nft-restore");
        assert_eq!(paths[1], "/usr/sbin/iptables-nft-restore");
        assert_eq!(paths[4], "/bin/iptables-nft-restore");
        assert_eq!(paths[5], "iptables-restore");
        assert_eq!(paths[9], "/bin/iptables-restore");
    }

    #[test]
    fn test_parse_version_output() {
        let probe = parse_version_output("iptables v1.8.7 (nf_tables)\n").expect("parses");
        assert_eq!(probe.mode, IptablesMode::Nft);
        assert_eq!(
            probe.version,
            Some(Version {
                major: 1,
                minor: 8,
                patch: 7
            })
        );

        let probe = parse_version_output("ip6tables-legacy v1.8.4 (legacy)").expect("parses");
        assert_eq!(probe.mode, IptablesMode::Legacy);

        let probe = parse_version_output("iptables v1.6").expect("parses");
        assert_eq!(probe.mode, IptablesMode::Legacy);
        assert_eq!(probe.version.map(|v| v.to_string()), Some("1.6.0".to_string()));

        assert!(parse_version_output("nft v1.0.2 (Lester Gooch #4)").is_err());
    }

    #[test]
    fn test_format_version_error() {
        let err = format_version_error("first line\nsecond  line.\n");
        assert_eq!(err.to_string(), "first line second line");

        let long = "x".repeat(600);
        let err = format_version_error(&long);
        assert_eq!(err.to_string().len(), 503);
        assert!(err.to_string().ends_with("..."));
    }

    #[tokio::test]
    async fn test_probe_treats_missing_version_flag_as_legacy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("iptables");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&script).expect("create script");
            file.write_all(
                b"#!/bin/sh\necho \"iptables: unrecognized option '--version'\" >&2\nexit 2\n",
            )
            .expect("write script");
            // Closed before exec to avoid ETXTBSY.
            file.sync_all().expect("sync script");
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let probe = probe_version(&script).await.expect("old binaries are legacy");
        assert_eq!(probe.mode, IptablesMode::Legacy);
        assert_eq!(probe.version, None);
    }

    #[test]
    fn test_find_path_for_explicit_paths() {
        assert_eq!(find_path(Path::new("/bin/sh")), Some(PathBuf::from("/bin/sh")));
        assert_eq!(find_path(Path::new("/nonexistent/iptables")), None);
        assert_eq!(find_path(Path::new("tproxy-definitely-missing-binary")), None);
    }

    #[test]
    fn test_chains_from_save_output() {
        let output = "*nat\n:PREROUTING ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n:DOCKER_OUTPUT - [0:0]\nCOMMIT\n";
        assert_eq!(
            chains_from_save_output(output),
            Chains {
                docker_output: true,
                custom: false
            }
        );

        let output = "*nat\n:OUTPUT ACCEPT [0:0]\n:TPROXY_MESH_OUTBOUND - [0:0]\nCOMMIT\n";
        assert_eq!(
            chains_from_save_output(output),
            Chains {
                docker_output: false,
                custom: true
            }
        );
    }

    #[test]
    fn test_minimal_requirements() {
        assert!(Functionality::assumed().verify_minimal_requirements().is_ok());

        let mut functionality = Functionality::assumed();
        functionality.tables.nat = false;
        functionality.modules.owner = false;
        match functionality.verify_minimal_requirements() {
            Err(Error::UnmetRequirements { missing }) => {
                assert_eq!(missing, vec!["table nat", "module owner"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_restore_args_only_for_legacy() {
        let mut cfg = Config::default();
        cfg.wait = 5;
        cfg.wait_interval = 2;
        assert!(build_restore_args(&cfg, IptablesMode::Nft).is_empty());
        assert_eq!(
            build_restore_args(&cfg, IptablesMode::Legacy),
            vec!["--wait=5", "--wait-interval=2"]
        );

        cfg.wait = 0;
        cfg.wait_interval = 0;
        assert!(build_restore_args(&cfg, IptablesMode::Legacy).is_empty());
    }

    #[test]
    fn test_select_flavor_single_viable() {
        let chosen = select(
            Err(anyhow::anyhow!("no nft")),
            Ok(executables(IptablesMode::Legacy, false, false)),
            false,
        )
        .expect("legacy works");
        assert_eq!(chosen.mode, IptablesMode::Legacy);

        let chosen = select(
            Ok(executables(IptablesMode::Nft, false, false)),
            Err(anyhow::anyhow!("no legacy")),
            false,
        )
        .expect("nft works");
        assert_eq!(chosen.mode, IptablesMode::Nft);
    }

    #[test]
    fn test_select_flavor_neither_viable() {
        let err = select(
            Err(anyhow::anyhow!("no nft")),
            Err(anyhow::anyhow!("no legacy")),
            false,
        )
        .expect_err("nothing works");
        assert!(format!("{:#}", err).contains("failed to find valid nft or legacy"));

        let chosen = select(
            Err(anyhow::anyhow!("no nft")),
            Err(anyhow::anyhow!("no legacy")),
            true,
        )
        .expect("dry-run degrades");
        assert_eq!(chosen.functionality, Functionality::assumed());
    }

    #[test]
    fn test_select_flavor_conflicts() {
        let cases = [
            // (nft docker, nft custom, legacy docker, legacy custom, expected)
            (true, true, true, true, IptablesMode::Nft),
            (false, false, true, true, IptablesMode::Legacy),
            (true, true, false, false, IptablesMode::Nft),
            (false, false, false, true, IptablesMode::Legacy),
            (false, true, false, true, IptablesMode::Nft),
            (false, false, false, false, IptablesMode::Nft),
        ];

        for (nft_docker, nft_custom, legacy_docker, legacy_custom, expected) in cases {
            let chosen = select(
                Ok(executables(IptablesMode::Nft, nft_docker, nft_custom)),
                Ok(executables(IptablesMode::Legacy, legacy_docker, legacy_custom)),
                false,
            )
            .expect("both work");
            assert_eq!(
                chosen.mode, expected,
                "nft=({}, {}) legacy=({}, {})",
                nft_docker, nft_custom, legacy_docker, legacy_custom
            );
        }
    }
}
