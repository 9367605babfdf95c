//! Classification of script modules against the installed ones.

use super::script::ScriptModule;
use super::version::{is_preview_build, ResolvedVersion};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleStatus {
    NewRelease,
    NewBeta,
    /// New IB/DB/PB/CB build.
    NewPreview,
    /// Hidden by the check options or the user's filter list.
    Filtered,
    /// The installed module is the same or newer.
    Installed,
}

/// Which kinds of versions the user wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOptions {
    pub check_release: bool,
    pub check_beta: bool,
    pub check_preview: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            check_release: true,
            check_beta: false,
            check_preview: false,
        }
    }
}

impl CheckOptions {
    /// Defaults for a client running `version`; preview builds check for
    /// newer preview builds.
    pub fn for_running_version(version: &str) -> Self {
        Self {
            check_preview: is_preview_build(version),
            ..Self::default()
        }
    }
}

/// User filter entries: `name` hides every version of a module, `name|version`
/// only that version. Compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    items: Vec<String>,
}

impl Filters {
    /// Adds an entry unless an equal one is already present.
    pub fn add(&mut self, item: impl Into<String>) {
        let item = item.into();
        if !self.items.iter().any(|i| i.eq_ignore_ascii_case(&item)) {
            self.items.push(item);
        }
    }

    pub fn add_version(&mut self, name: &str, version: &str) {
        self.add(format!("{}|{}", name, version));
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.items.iter().any(|item| match item.split_once('|') {
            Some((n, v)) => n.eq_ignore_ascii_case(name) && v.eq_ignore_ascii_case(version),
            None => item.eq_ignore_ascii_case(name),
        })
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }
}

/// A module installed locally.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledModule {
    /// File name; any directory part is dropped.
    pub module: String,
    pub version: String,
    pub resolved: ResolvedVersion,
}

impl InstalledModule {
    pub fn new(module: &str, version: &str) -> Self {
        let file = module.rsplit(['\\', '/']).next().unwrap_or(module);
        Self {
            module: file.to_string(),
            version: version.to_string(),
            resolved: ResolvedVersion::parse(version),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Status of each script module, in script order.
    pub statuses: Vec<ModuleStatus>,
}

impl CheckReport {
    pub fn count(&self, status: ModuleStatus) -> usize {
        self.statuses.iter().filter(|&&s| s == status).count()
    }

    /// At least one new release, beta or preview build.
    pub fn found_new(&self) -> bool {
        self.statuses.iter().any(|s| {
            matches!(
                s,
                ModuleStatus::NewRelease | ModuleStatus::NewBeta | ModuleStatus::NewPreview
            )
        })
    }

    /// Indexes of the modules with `status`.
    pub fn indexes(&self, status: ModuleStatus) -> impl Iterator<Item = usize> + '_ {
        self.statuses
            .iter()
            .enumerate()
            .filter(move |(_, &s)| s == status)
            .map(|(i, _)| i)
    }
}

fn is_filtered(m: &ScriptModule, options: &CheckOptions, filters: &Filters) -> bool {
    let v = &m.resolved;
    let hidden_kind = (!options.check_release && !v.beta && !v.is_special_build())
        || (!options.check_preview && v.is_special_build())
        || (!options.check_beta && v.beta && !v.is_special_build());
    hidden_kind || filters.contains(&m.name, &m.version)
}

fn is_newer(script: &ResolvedVersion, installed: Option<&ResolvedVersion>) -> bool {
    let Some(inst) = installed else {
        return true;
    };
    if inst.beta == script.beta {
        return inst.cmp_same_channel(script) == Ordering::Less;
    }
    if inst.beta {
        // A beta upgrades to the release of the same version and anything later.
        inst.release_part() <= script.packed
    } else {
        // A release only upgrades to betas of a later version.
        inst.packed < script.release_part()
    }
}

/// Classify every script module.
pub fn classify(
    modules: &[ScriptModule],
    installed: &[InstalledModule],
    options: &CheckOptions,
    filters: &Filters,
) -> CheckReport {
    let statuses = modules
        .iter()
        .map(|m| {
            if is_filtered(m, options, filters) {
                return ModuleStatus::Filtered;
            }
            let inst = installed
                .iter()
                .find(|i| i.module.eq_ignore_ascii_case(&m.module))
                .map(|i| &i.resolved);
            if !is_newer(&m.resolved, inst) {
                ModuleStatus::Installed
            } else if m.resolved.is_special_build() {
                ModuleStatus::NewPreview
            } else if m.resolved.beta {
                ModuleStatus::NewBeta
            } else {
                ModuleStatus::NewRelease
            }
        })
        .collect();
    let report = CheckReport { statuses };
    log::info!(
        "Update check: {} new release(s), {} new beta(s), {} new preview build(s), {} filtered",
        report.count(ModuleStatus::NewRelease),
        report.count(ModuleStatus::NewBeta),
        report.count(ModuleStatus::NewPreview),
        report.count(ModuleStatus::Filtered)
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, version: &str) -> ScriptModule {
        ScriptModule {
            module: format!("{}.spl", name),
            name: name.to_string(),
            version: version.to_string(),
            resolved: ResolvedVersion::parse(version),
            beta_section: version.contains("beta"),
            url: String::new(),
            infos: Vec::new(),
        }
    }

    fn all() -> CheckOptions {
        CheckOptions {
            check_release: true,
            check_beta: true,
            check_preview: true,
        }
    }

    fn status(script: &str, installed: Option<&str>) -> ModuleStatus {
        let m = [module("ftp", script)];
        let inst: Vec<InstalledModule> = installed
            .map(|v| InstalledModule::new("C:\\Program Files\\plugins\\FTP.SPL", v))
            .into_iter()
            .collect();
        classify(&m, &inst, &all(), &Filters::default()).statuses[0]
    }

    #[test]
    fn not_installed_is_new() {
        assert_eq!(status("4.0", None), ModuleStatus::NewRelease);
        assert_eq!(status("4.1 beta 1", None), ModuleStatus::NewBeta);
        assert_eq!(status("4.1 beta 1 (PB 3)", None), ModuleStatus::NewPreview);
    }

    #[test]
    fn same_channel_versions() {
        assert_eq!(status("4.0", Some("3.0")), ModuleStatus::NewRelease);
        assert_eq!(status("4.0", Some("4.0")), ModuleStatus::Installed);
        assert_eq!(status("3.0", Some("4.0")), ModuleStatus::Installed);
        assert_eq!(status("4.1 beta 2", Some("4.1 beta 1")), ModuleStatus::NewBeta);
    }

    #[test]
    fn special_build_tie_break() {
        // final build beats a preview build of the same version
        assert_eq!(status("4.0", Some("4.0 (PB 5)")), ModuleStatus::NewRelease);
        // higher preview number wins
        assert_eq!(status("4.0 (PB 6)", Some("4.0 (PB 5)")), ModuleStatus::NewPreview);
        assert_eq!(status("4.0 (PB 5)", Some("4.0 (PB 6)")), ModuleStatus::Installed);
        // a preview never replaces the final build
        assert_eq!(status("4.0 (PB 9)", Some("4.0")), ModuleStatus::Installed);
    }

    #[test]
    fn crossing_beta_and_release() {
        assert_eq!(status("2.52", Some("2.52 beta 2")), ModuleStatus::NewRelease);
        assert_eq!(status("2.51", Some("2.52 beta 2")), ModuleStatus::Installed);
        assert_eq!(status("2.53 beta 1", Some("2.52")), ModuleStatus::NewBeta);
        assert_eq!(status("2.52 beta 3", Some("2.52")), ModuleStatus::Installed);
    }

    #[test]
    fn options_and_filters() {
        let m = [module("ftp", "4.1 beta 1"), module("ftp", "4.0"), module("ftp", "4.0 (PB 2)")];
        let report = classify(&m, &[], &CheckOptions::default(), &Filters::default());
        assert_eq!(
            report.statuses,
            vec![ModuleStatus::Filtered, ModuleStatus::NewRelease, ModuleStatus::Filtered]
        );
        assert!(report.found_new());

        let mut filters = Filters::default();
        filters.add_version("FTP", "4.0");
        filters.add_version("ftp", "4.0");
        assert_eq!(filters.items().len(), 1);
        let report = classify(&m, &[], &all(), &filters);
        assert_eq!(report.statuses[1], ModuleStatus::Filtered);
        assert_eq!(report.indexes(ModuleStatus::NewBeta).collect::<Vec<_>>(), vec![0]);

        filters.add("ftp");
        let report = classify(&m, &[], &all(), &filters);
        assert_eq!(report.count(ModuleStatus::Filtered), 3);
        assert!(!report.found_new());
    }

    #[test]
    fn preview_client_checks_previews() {
        assert!(CheckOptions::for_running_version("4.0 beta 1 (PB 12)").check_preview);
        assert!(!CheckOptions::for_running_version("4.0").check_preview);
    }
}
