use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use conda_pypi_channel::{ChannelIndex, ChannelRecord, ChannelSource};
use itertools::Itertools;
use rattler_conda_types::{MatchSpec, Matches, ParseStrictness, Platform, RepoDataRecord};
use rattler_solve::{ChannelPriority, SolverImpl, SolverTask, resolvo};
use reqwest_middleware::ClientWithMiddleware;
use tokio::task::JoinError;
use url::Url;

use crate::{CondaSolver, InstalledPackage, Solution, SolveError};

/// A solver working directly on channel repodata.
///
/// Solves with resolvo under strict channel priority: a package is only
/// taken from the highest priority channel that has it. Installed records
/// are favored, they are kept unless a spec rules them out. Virtual package
/// dependencies (`__glibc`, `__unix`, ...) are assumed to be satisfied.
#[derive(Debug, Clone)]
pub struct RepodataSolver {
    client: ClientWithMiddleware,
    platforms: Vec<Platform>,
}

impl RepodataSolver {
    pub fn new(client: ClientWithMiddleware) -> Self {
        Self {
            client,
            platforms: vec![Platform::current()],
        }
    }

    /// The platform subdirs to load next to `noarch`.
    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn solve_with_index(
        index: &ChannelIndex,
        specs: &[String],
        installed: &[InstalledPackage],
    ) -> Result<Solution, SolveError> {
        let requested = specs
            .iter()
            .map(|spec| parse_spec(spec).map(|parsed| (spec, parsed)))
            .filter_ok(|(_, spec)| !is_virtual(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let not_found = requested
            .iter()
            .filter(|(_, spec)| !is_provided(index, spec))
            .map(|(source, _)| source.to_string())
            .collect_vec();
        if !not_found.is_empty() {
            tracing::debug!("packages not found: {}", not_found.join(", "));
            return Err(SolveError::PackagesNotFound(not_found));
        }

        // One group per channel, in priority order.
        let mut groups: BTreeMap<usize, Vec<RepoDataRecord>> = BTreeMap::new();
        let mut by_url: HashMap<Url, &ChannelRecord> = HashMap::new();
        for record in index.iter() {
            let mut repodata_record = record.record.clone();
            repodata_record
                .package_record
                .depends
                .retain(|dependency| !dependency.starts_with("__"));
            groups.entry(record.priority).or_default().push(repodata_record);
            by_url.insert(record.record.url.clone(), record);
        }

        let locked_packages = groups
            .values()
            .flatten()
            .filter(|record| is_installed(record, installed))
            .cloned()
            .collect_vec();

        let task = SolverTask {
            specs: requested.into_iter().map(|(_, spec)| spec).collect(),
            locked_packages,
            channel_priority: ChannelPriority::Strict,
            ..SolverTask::from_iter(groups.values())
        };

        match resolvo::Solver.solve(task) {
            Ok(result) => Ok(Solution {
                records: result
                    .records
                    .iter()
                    .filter_map(|record| by_url.get(&record.url).map(|record| (*record).clone()))
                    .collect(),
            }),
            Err(rattler_solve::SolveError::Unsolvable(messages)) => {
                let missing = missing_dependencies(index, specs);
                let message = if missing.is_empty() {
                    messages.join("\n")
                } else {
                    missing.join("\n")
                };
                tracing::debug!("unsatisfiable:\n{message}");
                Err(SolveError::Unsatisfiable { message })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_spec(spec: &str) -> Result<MatchSpec, SolveError> {
    MatchSpec::from_str(spec, ParseStrictness::Lenient)
        .map_err(|err| SolveError::InvalidSpec(spec.to_string(), err))
}

fn is_virtual(spec: &MatchSpec) -> bool {
    spec.name
        .as_ref()
        .is_some_and(|name| name.as_normalized().starts_with("__"))
}

/// Whether the highest priority channel that has the package provides a
/// record matching `spec`.
fn is_provided(index: &ChannelIndex, spec: &MatchSpec) -> bool {
    let Some(name) = &spec.name else {
        return false;
    };
    index
        .preferred_records(name.as_normalized())
        .iter()
        .any(|record| spec.matches(record.package_record()))
}

fn is_installed(record: &RepoDataRecord, installed: &[InstalledPackage]) -> bool {
    let record = &record.package_record;
    installed.iter().any(|package| {
        package.name == record.name.as_normalized()
            && package.version == record.version.as_str()
            && package.build == record.build
    })
}

/// Walks the dependency closure of `specs` and reports every dependency no
/// channel provides as `nothing provides <dep> needed by <stem>`.
fn missing_dependencies(index: &ChannelIndex, specs: &[String]) -> Vec<String> {
    let mut missing = Vec::new();
    let mut seen_specs = HashSet::new();
    let mut seen_records = HashSet::new();
    let mut queue: VecDeque<String> = specs.iter().cloned().collect();

    while let Some(spec) = queue.pop_front() {
        if !seen_specs.insert(spec.clone()) {
            continue;
        }
        let Ok(spec) = MatchSpec::from_str(&spec, ParseStrictness::Lenient) else {
            continue;
        };
        let Some(name) = &spec.name else {
            continue;
        };
        let candidates = index
            .preferred_records(name.as_normalized())
            .iter()
            .filter(|record| spec.matches(record.package_record()));
        for record in candidates {
            if !seen_records.insert(record.record.url.clone()) {
                continue;
            }
            for dependency in record.depends() {
                let provided = MatchSpec::from_str(dependency, ParseStrictness::Lenient)
                    .is_ok_and(|dependency| is_virtual(&dependency) || is_provided(index, &dependency));
                if provided {
                    queue.push_back(dependency.clone());
                } else {
                    missing.push(format!(
                        "nothing provides {dependency} needed by {}",
                        record.stem()
                    ));
                }
            }
        }
    }
    missing.into_iter().unique().collect()
}

#[async_trait]
impl CondaSolver for RepodataSolver {
    async fn solve(
        &self,
        specs: &[String],
        channels: &[ChannelSource],
        installed: &[InstalledPackage],
    ) -> Result<Solution, SolveError> {
        let index = ChannelIndex::load(&self.client, channels, &self.platforms).await?;
        tracing::debug!(
            "solving {} against {} records from {}",
            specs.join(", "),
            index.len(),
            index.channels().join(", ")
        );

        let specs = specs.to_vec();
        let installed = installed.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            Self::solve_with_index(&index, &specs, &installed)
        })
        .await;

        match result.map_err(JoinError::try_into_panic) {
            Err(Err(_)) => Err(SolveError::Cancelled),
            Err(Ok(panic)) => std::panic::resume_unwind(panic),
            Ok(result) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use conda_pypi_test_utils::mock_repo_data::{MockChannel, MockRepoData, Package};

    use super::*;
    use crate::parse_unsatisfiable_message;

    fn conda_forge() -> MockChannel {
        MockRepoData::default()
            .with_package(Package::build("python", "3.11.9").with_build("h1_0").finish())
            .with_package(Package::build("python", "3.12.4").with_build("h1_0").finish())
            .with_package(Package::build("urllib3", "1.26.18").finish())
            .with_package(
                Package::build("urllib3", "2.2.1")
                    .with_dependency("python >=3.8")
                    .finish(),
            )
            .with_package(
                Package::build("requests", "2.32.3")
                    .with_dependency("python >=3.8")
                    .with_dependency("urllib3 >=1.21.1,<3")
                    .with_dependency("__unix")
                    .finish(),
            )
            .into_channel()
            .unwrap()
    }

    async fn index(channels: &[&MockChannel]) -> ChannelIndex {
        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let sources = channels
            .iter()
            .enumerate()
            .map(|(idx, channel)| ChannelSource::local(format!("channel-{idx}"), channel.path()))
            .collect_vec();
        ChannelIndex::load(&client, &sources, &[Platform::current()])
            .await
            .unwrap()
    }

    fn specs(specs: &[&str]) -> Vec<String> {
        specs.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_solve_picks_highest_versions() {
        let channel = conda_forge();
        let index = index(&[&channel]).await;

        let solution = RepodataSolver::solve_with_index(&index, &specs(&["requests"]), &[]).unwrap();
        assert_eq!(
            solution.summary(),
            vec![
                "channel-0::python-3.12.4-h1_0",
                "channel-0::requests-2.32.3-0",
                "channel-0::urllib3-2.2.1-0",
            ]
        );
    }

    #[tokio::test]
    async fn test_solve_prefers_installed() {
        let channel = conda_forge();
        let index = index(&[&channel]).await;
        let installed = vec![InstalledPackage {
            name: "python".to_string(),
            version: "3.11.9".to_string(),
            build: "h1_0".to_string(),
        }];

        let solution =
            RepodataSolver::solve_with_index(&index, &specs(&["requests"]), &installed).unwrap();
        assert_eq!(solution.get("python").unwrap().version().as_str(), "3.11.9");

        let solution =
            RepodataSolver::solve_with_index(&index, &specs(&["python >=3.12"]), &installed)
                .unwrap();
        assert_eq!(solution.get("python").unwrap().version().as_str(), "3.12.4");
    }

    #[tokio::test]
    async fn test_solve_reports_missing_requested_packages() {
        let channel = conda_forge();
        let index = index(&[&channel]).await;

        let err = RepodataSolver::solve_with_index(
            &index,
            &specs(&["requests", "numpy", "urllib3 >=3", "__glibc"]),
            &[],
        )
        .unwrap_err();
        let SolveError::PackagesNotFound(missing) = err else {
            panic!("expected missing packages, got {err:?}");
        };
        assert_eq!(missing, vec!["numpy", "urllib3 >=3"]);
    }

    #[tokio::test]
    async fn test_solve_reports_missing_dependencies() {
        let channel = MockRepoData::default()
            .with_package(Package::build("python", "3.12.4").finish())
            .with_package(
                Package::build("demo-pkg", "1.0.0")
                    .with_build("pypi_0")
                    .with_dependency("python >=3.8")
                    .with_dependency("tomli")
                    .with_dependency("requests >=2")
                    .finish(),
            )
            .into_channel()
            .unwrap();
        let index = index(&[&channel]).await;

        let err = RepodataSolver::solve_with_index(&index, &specs(&["demo-pkg"]), &[]).unwrap_err();
        let SolveError::Unsatisfiable { message } = err else {
            panic!("expected an unsatisfiable error, got {err:?}");
        };
        assert_eq!(
            parse_unsatisfiable_message(&message),
            vec!["tomli", "requests >=2"]
        );
        assert!(message.contains("needed by demo-pkg-1.0.0-pypi_0"));
    }

    #[tokio::test]
    async fn test_solve_strict_channel_priority() {
        let local = MockRepoData::default()
            .with_package(Package::build("requests", "2.31.0").finish())
            .into_channel()
            .unwrap();
        let channel = conda_forge();
        let index = index(&[&local, &channel]).await;

        let solution = RepodataSolver::solve_with_index(&index, &specs(&["requests"]), &[]).unwrap();
        let requests = solution.get("requests").unwrap();
        assert_eq!(requests.version().as_str(), "2.31.0");
        assert_eq!(requests.channel, "channel-0");

        // The lower priority channel is not consulted for a newer version.
        let err =
            RepodataSolver::solve_with_index(&index, &specs(&["requests >=2.32"]), &[]).unwrap_err();
        assert!(matches!(err, SolveError::PackagesNotFound(_)));
    }

    #[tokio::test]
    async fn test_solve_honours_constrains() {
        let channel = MockRepoData::default()
            .with_package(
                Package::build("a", "1.0")
                    .with_constraint("b <2")
                    .finish(),
            )
            .with_package(Package::build("b", "1.5").finish())
            .with_package(Package::build("b", "2.0").finish())
            .into_channel()
            .unwrap();
        let index = index(&[&channel]).await;

        let solution = RepodataSolver::solve_with_index(&index, &specs(&["a", "b"]), &[]).unwrap();
        assert_eq!(solution.get("b").unwrap().version().as_str(), "1.5");

        let err = RepodataSolver::solve_with_index(&index, &specs(&["b >=2", "a"]), &[]).unwrap_err();
        let SolveError::Unsatisfiable { message } = err else {
            panic!("expected an unsatisfiable error, got {err:?}");
        };
        assert!(!message.is_empty());
        assert!(parse_unsatisfiable_message(&message).is_empty());
    }

    #[tokio::test]
    async fn test_solve_backtracks_to_compatible_versions() {
        // Picking the newest `b` first conflicts with `c`, the solve has to
        // revisit that choice.
        let channel = MockRepoData::default()
            .with_package(
                Package::build("a", "1.0")
                    .with_dependency("b")
                    .with_dependency("c")
                    .finish(),
            )
            .with_package(Package::build("b", "1.0").finish())
            .with_package(Package::build("b", "2.0").finish())
            .with_package(Package::build("c", "1.0").with_dependency("b <2").finish())
            .into_channel()
            .unwrap();
        let index = index(&[&channel]).await;

        let solution = RepodataSolver::solve_with_index(&index, &specs(&["a"]), &[]).unwrap();
        assert_eq!(
            solution.summary(),
            vec![
                "channel-0::a-1.0-0",
                "channel-0::b-1.0-0",
                "channel-0::c-1.0-0",
            ]
        );
    }

    #[tokio::test]
    async fn test_solve_rejects_invalid_specs() {
        let channel = conda_forge();
        let index = index(&[&channel]).await;

        let err = RepodataSolver::solve_with_index(&index, &specs(&["requests[version=2"]), &[])
            .unwrap_err();
        assert!(matches!(err, SolveError::InvalidSpec(spec, _) if spec == "requests[version=2"));
    }

    #[tokio::test]
    async fn test_solve_through_trait() {
        let channel = conda_forge();
        let solver = RepodataSolver::new(ClientWithMiddleware::from(reqwest::Client::new()));
        let solution = solver
            .solve(
                &specs(&["urllib3 <2"]),
                &[ChannelSource::local("conda-forge", channel.path())],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(solution.summary(), vec!["conda-forge::urllib3-1.26.18-0"]);
    }

    #[tokio::test]
    async fn test_solve_loads_requested_platforms() {
        let channel = MockRepoData::default()
            .with_package(
                Package::build("zlib", "1.3.1")
                    .with_build("h0_0")
                    .with_subdir(Platform::Linux64)
                    .finish(),
            )
            .with_package(
                Package::build("zlib", "1.3.1")
                    .with_build("h0_1")
                    .with_build_number(1)
                    .with_subdir(Platform::Linux64)
                    .finish(),
            )
            .into_channel()
            .unwrap();
        let sources = [ChannelSource::local("conda-forge", channel.path())];
        let client = ClientWithMiddleware::from(reqwest::Client::new());

        let solution = RepodataSolver::new(client.clone())
            .with_platforms(vec![Platform::Linux64])
            .solve(&specs(&["zlib"]), &sources, &[])
            .await
            .unwrap();
        assert_eq!(solution.summary(), vec!["conda-forge::zlib-1.3.1-h0_1"]);

        let err = RepodataSolver::new(client)
            .with_platforms(vec![Platform::Win64])
            .solve(&specs(&["zlib"]), &sources, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SolveError::PackagesNotFound(_)));
    }
}
