//! Test plan building, execution and reporting.
//!
//! A test plan is an ordered set of test cases read from a config file.
//! Cases run strictly sequentially against the reserved device, each in
//! its own timestamped working directory, and the run ends with one
//! xunit-style XML report.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    config,
    device::Device,
    error::{Error, Result},
    pattern,
    registry::PluginRegistry,
    runner::CmdOutcome,
};

/// Everything a tester driver gets to see for one case run.
pub struct TestContext<'a> {
    pub name: &'a str,
    pub parameters: &'a str,
    pub user: &'a str,
    pub device: &'a Device,
    /// Isolated working directory prepared for this case.
    pub test_dir: &'a Path,
}

/// Driver owning a table of named test operations.
///
/// The selector named by a test case is checked against
/// [`TesterDriver::has_operation`] when the plan is built, so a typo in
/// the plan aborts before any test runs; dispatch at run time is the
/// same explicit lookup.
#[async_trait]
pub trait TesterDriver: std::fmt::Debug + Send + Sync {
    fn has_operation(&self, selector: &str) -> bool;

    async fn run(&self, selector: &str, ctx: TestContext<'_>) -> anyhow::Result<CmdOutcome>;
}

/// One test case: the declared input fields plus the state populated
/// while it executes. Mutable only during its own [`TestCase::execute`].
#[derive(Debug)]
pub struct TestCase {
    name: String,
    test: String,
    parameters: String,
    pass_regex: String,
    user: String,
    tester: Arc<dyn TesterDriver>,

    result: Option<bool>,
    started: Option<DateTime<Local>>,
    ended: Option<DateTime<Local>>,
    duration: Option<Duration>,
    output: Option<CmdOutcome>,
    test_dir: Option<PathBuf>,
}

impl TestCase {
    fn new(
        name: String,
        test: String,
        parameters: String,
        pass_regex: String,
        user: String,
        tester: Arc<dyn TesterDriver>,
    ) -> Result<Self> {
        if name.is_empty() || test.is_empty() {
            return Err(Error::config(
                "test plan",
                "test case name and test selector must be non-empty",
            ));
        }
        Ok(Self {
            name,
            test,
            parameters,
            pass_regex,
            user,
            tester,
            result: None,
            started: None,
            ended: None,
            duration: None,
            output: None,
            test_dir: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classified outcome; `None` until the case has run.
    pub fn result(&self) -> Option<bool> {
        self.result
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Wall-clock start of the case run.
    pub fn started(&self) -> Option<DateTime<Local>> {
        self.started
    }

    pub fn ended(&self) -> Option<DateTime<Local>> {
        self.ended
    }

    pub fn test_dir(&self) -> Option<&Path> {
        self.test_dir.as_deref()
    }

    fn prepare_test_dir(&mut self, exec_root: &Path) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d%H%M%S%6f");
        let dir = exec_root.join(format!("{stamp}-{}", self.name));
        std::fs::create_dir_all(&dir)?;
        self.test_dir = Some(dir.clone());
        Ok(dir)
    }

    async fn execute(&mut self, device: &Device, exec_root: &Path) -> Result<bool> {
        let start = std::time::Instant::now();
        self.started = Some(Local::now());
        tracing::info!("Test {:?} starting", self.name);
        let dir = self.prepare_test_dir(exec_root)?;

        let ctx = TestContext {
            name: &self.name,
            parameters: &self.parameters,
            user: &self.user,
            device,
            test_dir: &dir,
        };
        match self.tester.run(&self.test, ctx).await {
            Ok(outcome) => self.output = Some(outcome),
            Err(e) => {
                tracing::error!("Tester driver failed for {:?}: {e}", self.name);
                self.output = None;
            }
        }

        self.duration = Some(start.elapsed());
        self.ended = Some(Local::now());
        let passed = classify(self.output.as_ref(), &self.pass_regex);
        self.result = Some(passed);
        tracing::info!(
            "Test {:?} {} in {:?}",
            self.name,
            if passed { "passed" } else { "failed" },
            self.duration.unwrap_or_default()
        );
        Ok(passed)
    }

    fn xunit_fragment(&self) -> TestCaseXml {
        let passed = self.result.unwrap_or(false);
        let failure = (!passed).then(|| FailureXml {
            message: "test failure".into(),
            text: match &self.output {
                Some(CmdOutcome::Completed(res)) => {
                    format!("{}{}", res.stdout_lossy(), res.stderr_lossy())
                }
                Some(CmdOutcome::TimedOut) => "test timed out".into(),
                None => "tester driver error".into(),
            },
        });
        TestCaseXml {
            name: self.name.clone(),
            passed: u8::from(passed),
            duration: self.duration.unwrap_or_default().as_secs_f64(),
            failure,
        }
    }
}

/// Outcome classification shared by every test case:
/// a non-zero return code always fails; return code zero passes with an
/// empty pattern, or when at least one stdout line matches the pattern
/// anchored at its start. Timeouts and driver errors always fail.
fn classify(outcome: Option<&CmdOutcome>, pass_regex: &str) -> bool {
    let Some(CmdOutcome::Completed(res)) = outcome else {
        return false;
    };
    if !res.success() {
        tracing::info!("Test failed: returncode {}", res.return_code);
        return false;
    }
    if pass_regex.is_empty() {
        return true;
    }
    res.stdout_lossy()
        .lines()
        .any(|line| pattern::matches_start(pass_regex, line).unwrap_or(false))
}

/// Ordered sequence of test cases: built once, executed once.
#[derive(Debug)]
pub struct TestPlan {
    cases: Vec<TestCase>,
}

/// Aggregate of one executed plan.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub tests: usize,
    pub failures: usize,
    pub elapsed: Duration,
    pub report_path: Option<PathBuf>,
}

impl TestReport {
    pub fn all_passed(&self) -> bool {
        self.failures == 0
    }
}

impl TestPlan {
    /// Parse the test plan and resolve every tester up front.
    ///
    /// An unresolved tester identifier or a selector the tester does not
    /// provide fails the whole build; so does an empty plan.
    pub fn load(path: &Path, registry: &PluginRegistry) -> Result<Self> {
        let ini = ini::Ini::load_from_file(path)
            .map_err(|e| Error::config(path, e.to_string()))?;

        let mut cases = Vec::new();
        for (section, props) in ini.iter() {
            let Some(name) = section else { continue };
            let field = |key: &str| -> Result<String> {
                props.get(key).map(str::to_owned).ok_or_else(|| {
                    Error::config(path, format!("missing {key:?} in test case {name:?}"))
                })
            };
            let tester_name = field("tester")?;
            let test = field("test")?;
            let tester = registry.resolve_tester(&tester_name)?;
            if !tester.has_operation(&test) {
                return Err(Error::config(
                    path,
                    format!("no operation {test:?} in tester {tester_name:?}"),
                ));
            }
            cases.push(TestCase::new(
                name.to_owned(),
                test,
                field("parameters")?,
                field("pass_regex")?,
                field("user")?,
                tester,
            )?);
        }
        if cases.is_empty() {
            return Err(Error::NoTestCases);
        }
        Ok(Self { cases })
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Run every case in file order, sequentially, then aggregate and
    /// persist the XML report alongside the first case's working
    /// directory.
    pub async fn execute(&mut self, device: &Device) -> Result<TestReport> {
        if self.cases.is_empty() {
            return Err(Error::NoTestCases);
        }
        let exec_root = PathBuf::from(format!("{}{}", config::exec_root(), std::process::id()));

        let suite_start = Local::now();
        let started = std::time::Instant::now();
        let mut failures = 0;
        for case in &mut self.cases {
            if !case.execute(device, &exec_root).await? {
                failures += 1;
            }
        }
        let elapsed = started.elapsed();

        let suite = TestSuiteXml {
            errors: 0,
            failures,
            name: format!(
                "aft.{}.{}",
                suite_start.format("%Y%m%d%H%M%S"),
                std::process::id()
            ),
            skips: 0,
            tests: self.cases.len(),
            time: elapsed.as_secs_f64(),
            cases: self.cases.iter().map(TestCase::xunit_fragment).collect(),
        };
        let report_path = self.save_report(&suite)?;

        Ok(TestReport {
            tests: self.cases.len(),
            failures,
            elapsed,
            report_path,
        })
    }

    fn save_report(&self, suite: &TestSuiteXml) -> Result<Option<PathBuf>> {
        let Some(parent) = self
            .cases
            .first()
            .and_then(TestCase::test_dir)
            .and_then(Path::parent)
        else {
            return Ok(None);
        };
        let xml = quick_xml::se::to_string(suite)
            .map_err(|e| Error::config(parent, format!("cannot serialize report: {e}")))?;
        let path = parent.join("results.xml");
        std::fs::write(
            &path,
            format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{xml}\n"),
        )?;
        tracing::info!("Results saved to {path:?}");
        Ok(Some(path))
    }
}

#[derive(Serialize)]
#[serde(rename = "testsuite")]
struct TestSuiteXml {
    #[serde(rename = "@errors")]
    errors: u32,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@skips")]
    skips: u32,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testcase")]
    cases: Vec<TestCaseXml>,
}

#[derive(Serialize)]
struct TestCaseXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@passed")]
    passed: u8,
    #[serde(rename = "@duration")]
    duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureXml>,
}

#[derive(Serialize)]
struct FailureXml {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    text: String,
}
