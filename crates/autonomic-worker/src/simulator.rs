//! Scenario simulator
//!
//! Runs the reference remediation scenarios end to end against in-process
//! adapters and scripted providers, then a seeded load run across many
//! agents. Every run is checked against the loop's invariants:
//!
//! - No agent is left with an open episode once the channel drains
//! - Attempts used never exceed the episode budget
//! - Committed versions are contiguous and each one came from a succeeded episode
//! - One `deployment.success` per succeeded episode, one
//!   `optimization.failed` per escalated episode

use autonomic_core::{EpisodeStatus, LoopConfig, LoopEvent, Outcome, Providers, Stage, VersionStore};
use autonomic_model::AgentId;
use autonomic_test_utils::{JudgeScript, RefineScript, ScriptedProvider, World};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const AGENT: &str = "agent-x";

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Seed for the load run
    pub seed: u64,
    /// Agents in the load run
    pub agents: usize,
    /// Upper bound of audits submitted per agent in the load run
    pub audits_per_agent: usize,
    /// Time allowed for one scenario to drain
    pub drain_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            agents: 8,
            audits_per_agent: 3,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub violations: Vec<String>,
    pub episodes: usize,
    pub elapsed: Duration,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Final report from the simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub scenarios: Vec<ScenarioResult>,
}

impl SimulatorReport {
    /// Check if every scenario held every property
    pub fn passed(&self) -> bool {
        self.scenarios.iter().all(ScenarioResult::passed)
    }

    pub fn violation_count(&self) -> usize {
        self.scenarios.iter().map(|s| s.violations.len()).sum()
    }

    /// Generate text report
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Autonomic Loop Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Load agents: {}\n", self.config.agents));
        report.push_str(&format!("Violations: {}\n\n", self.violation_count()));

        for scenario in &self.scenarios {
            let status = if scenario.passed() { "PASS" } else { "FAIL" };
            report.push_str(&format!(
                "[{status}] {} ({} episodes, {}ms)\n",
                scenario.name,
                scenario.episodes,
                scenario.elapsed.as_millis()
            ));
            for violation in &scenario.violations {
                report.push_str(&format!("    - {violation}\n"));
            }
        }

        report.push_str(&format!(
            "\nResult: {}\n",
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        report
    }
}

/// Run every scenario
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let scenarios = vec![
        scenario_a(&config).await,
        scenario_b(&config).await,
        scenario_c(&config).await,
        scenario_d(&config).await,
        load(&config).await,
    ];
    for scenario in &scenarios {
        if scenario.passed() {
            info!(scenario = %scenario.name, episodes = scenario.episodes, "scenario passed");
        } else {
            warn!(scenario = %scenario.name, violations = scenario.violations.len(), "scenario failed");
        }
    }
    SimulatorReport { config, scenarios }
}

/// Collects violations for one scenario
struct Checker {
    name: &'static str,
    started: Instant,
    violations: Vec<String>,
}

impl Checker {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
            violations: Vec::new(),
        }
    }

    fn check(&mut self, holds: bool, what: impl Into<String>) {
        if !holds {
            self.violations.push(what.into());
        }
    }

    fn finish(self, world: &World) -> ScenarioResult {
        ScenarioResult {
            name: self.name.to_string(),
            violations: self.violations,
            episodes: world.tracker.len(),
            elapsed: self.started.elapsed(),
        }
    }
}

async fn submit(world: &World, agent: &str, checker: &mut Checker) {
    if let Err(e) = world.audit_flagged(agent).await {
        checker.check(false, format!("{agent}: audit not submitted: {e}"));
    }
}

async fn drain(world: &World, config: &SimulatorConfig, checker: &mut Checker) {
    let idle = world.run_until_idle(config.drain_timeout).await;
    checker.check(idle, format!("channel did not drain within {:?}", config.drain_timeout));
}

/// Failing audit, valid refinement, passing evaluation: v2 is deployed
async fn scenario_a(config: &SimulatorConfig) -> ScenarioResult {
    let mut checker = Checker::new("A: audit fail -> refine -> evaluate pass -> deploy");
    let world = World::scripted(Arc::new(ScriptedProvider::new()));
    world.seed_agent(AGENT);
    submit(&world, AGENT, &mut checker).await;
    drain(&world, config, &mut checker).await;

    let latest = world.store.get_latest(&AgentId::from(AGENT)).await;
    checker.check(
        latest.as_ref().is_ok_and(|c| c.version == 2),
        format!("expected v2 deployed, store has {:?}", latest.map(|c| c.version)),
    );
    let episodes = world.episodes(AGENT);
    checker.check(episodes.len() == 1, format!("expected 1 episode, found {}", episodes.len()));
    checker.check(
        episodes.first().is_some_and(|e| e.status == EpisodeStatus::Succeeded),
        "episode did not succeed",
    );
    check_invariants(&world, &[AGENT], &mut checker).await;
    checker.finish(&world)
}

/// Two rejected evaluations exhaust a budget of two
async fn scenario_b(config: &SimulatorConfig) -> ScenarioResult {
    let mut checker = Checker::new("B: evaluate fails twice -> escalate");
    let rejection = "candidate still promises a refund";
    let provider = ScriptedProvider::new().with_judge_script([
        JudgeScript::Fail(rejection.into()),
        JudgeScript::Fail(rejection.into()),
    ]);
    let world = World::scripted(Arc::new(provider));
    world.seed_agent(AGENT);
    submit(&world, AGENT, &mut checker).await;
    drain(&world, config, &mut checker).await;

    let episodes = world.episodes(AGENT);
    let episode = episodes.first();
    checker.check(
        episode.is_some_and(|e| e.status == EpisodeStatus::Escalated),
        "episode was not escalated",
    );
    checker.check(
        episode.is_some_and(|e| e.attempts_used == 2),
        format!("expected 2 attempts used, found {:?}", episode.map(|e| e.attempts_used)),
    );
    let refines = distinct_jobs(&world, Stage::Refine);
    checker.check(refines == 2, format!("expected 2 refine jobs, found {refines}"));
    let failed = world.telemetry.named("optimization.failed");
    checker.check(
        failed.iter().any(|e| matches!(e, LoopEvent::OptimizationFailed { agent_id, .. } if agent_id.as_str() == AGENT)),
        "no optimization.failed event for the agent",
    );
    let latest = world.store.get_latest(&AgentId::from(AGENT)).await;
    checker.check(
        latest.is_ok_and(|c| c.version == 1),
        "escalated episode changed the stored config",
    );
    check_invariants(&world, &[AGENT], &mut checker).await;
    checker.finish(&world)
}

/// Two failing audits race; one episode, one refine chain
async fn scenario_c(config: &SimulatorConfig) -> ScenarioResult {
    let mut checker = Checker::new("C: concurrent failing audits -> one episode");
    let provider = ScriptedProvider::new().with_latency(Duration::from_millis(25));
    let world = World::scripted(Arc::new(provider));
    world.seed_agent(AGENT);
    submit(&world, AGENT, &mut checker).await;
    submit(&world, AGENT, &mut checker).await;
    drain(&world, config, &mut checker).await;

    let episodes = world.episodes(AGENT).len();
    checker.check(episodes == 1, format!("expected 1 episode, found {episodes}"));
    let refines = distinct_jobs(&world, Stage::Refine);
    checker.check(refines == 1, format!("expected 1 refine job, found {refines}"));
    let verdicts = world.telemetry.count("audit.verdict");
    checker.check(verdicts == 2, format!("expected 2 audit verdicts, found {verdicts}"));
    check_invariants(&world, &[AGENT], &mut checker).await;
    checker.finish(&world)
}

/// Structurally invalid candidate consumes an attempt without evaluation
async fn scenario_d(config: &SimulatorConfig) -> ScenarioResult {
    let mut checker = Checker::new("D: invalid candidate consumes an attempt");
    let provider = ScriptedProvider::new().with_refine_script([RefineScript::EmptyPrompt]);
    let provider = Arc::new(provider);
    let world = World::scripted(provider.clone());
    world.seed_agent(AGENT);
    submit(&world, AGENT, &mut checker).await;
    drain(&world, config, &mut checker).await;

    let evaluations = world.jobs_on(Stage::Evaluate);
    checker.check(
        evaluations.iter().all(|j| j.attempt == 2),
        "an evaluate job was issued for the invalid candidate",
    );
    let episodes = world.episodes(AGENT);
    let episode = episodes.first();
    let invalid_recorded = episode.is_some_and(|e| {
        e.verdicts
            .iter()
            .any(|r| r.stage == Stage::Refine && r.attempt == 1 && !r.verdict.passed)
    });
    checker.check(invalid_recorded, "no failing refine verdict recorded for attempt 1");
    checker.check(
        episode.is_some_and(|e| e.attempts_used == 1),
        format!("expected 1 attempt used, found {:?}", episode.map(|e| e.attempts_used)),
    );
    checker.check(
        provider.refine_calls() == 2,
        format!("expected 2 refine calls, found {}", provider.refine_calls()),
    );
    check_invariants(&world, &[AGENT], &mut checker).await;
    checker.finish(&world)
}

/// Seeded mix of agents, audits and judge outcomes
async fn load(config: &SimulatorConfig) -> ScenarioResult {
    let mut checker = Checker::new("load: seeded multi-agent run");
    let mut rng = StdRng::seed_from_u64(config.seed);

    let judge: Vec<JudgeScript> = (0..config.agents * config.audits_per_agent * 2)
        .map(|_| {
            if rng.random_bool(0.6) {
                JudgeScript::Pass
            } else {
                JudgeScript::Fail("fix not verified on replay".into())
            }
        })
        .collect();
    let provider = ScriptedProvider::new()
        .with_judge_script(judge)
        .with_latency(Duration::from_millis(2));
    let loop_config = LoopConfig {
        workers_per_stage: 8,
        ..LoopConfig::default()
    };
    let world = World::new(loop_config, Providers::uniform(Arc::new(provider)));

    let names: Vec<String> = (0..config.agents).map(|i| format!("agent-{i}")).collect();
    for name in &names {
        world.seed_agent(name);
        for _ in 0..rng.random_range(1..=config.audits_per_agent.max(1)) {
            submit(&world, name, &mut checker).await;
        }
    }
    drain(&world, config, &mut checker).await;

    let agents: Vec<&str> = names.iter().map(String::as_str).collect();
    check_invariants(&world, &agents, &mut checker).await;
    checker.finish(&world)
}

fn distinct_jobs(world: &World, stage: Stage) -> usize {
    world
        .jobs_on(stage)
        .iter()
        .map(|j| j.job_id)
        .collect::<HashSet<_>>()
        .len()
}

async fn check_invariants(world: &World, agents: &[&str], checker: &mut Checker) {
    checker.check(
        world.tracker.open_count() == 0,
        format!("{} episodes still open after drain", world.tracker.open_count()),
    );

    let mut succeeded = 0;
    let mut escalated = 0;
    for agent in agents {
        let agent_id = AgentId::from(*agent);
        let episodes = world.episodes(agent);
        for episode in &episodes {
            checker.check(
                episode.attempts_used <= episode.max_attempts,
                format!(
                    "episode {} used {} of {} attempts",
                    episode.episode_id, episode.attempts_used, episode.max_attempts
                ),
            );
            match episode.outcome {
                Some(Outcome::Succeeded { .. }) => succeeded += 1,
                Some(Outcome::Escalated { .. }) => escalated += 1,
                _ => {}
            }
        }

        let history = match world.store.history(&agent_id).await {
            Ok(history) => history,
            Err(e) => {
                checker.check(false, format!("{agent}: history unavailable: {e}"));
                continue;
            }
        };
        let contiguous = (1u64..).zip(&history).all(|(v, c)| c.version == v);
        checker.check(contiguous, format!("{agent}: version history has gaps or duplicates"));

        for committed in history.iter().skip(1) {
            let from_success = episodes.iter().any(|e| {
                committed.committed_by(e.episode_id)
                    && e.outcome == Some(Outcome::Succeeded { version: committed.version })
            });
            checker.check(
                from_success,
                format!("{agent}: v{} was not committed by a succeeded episode", committed.version),
            );
        }
    }

    let deployments = world.telemetry.count("deployment.success");
    checker.check(
        deployments == succeeded,
        format!("{deployments} deployment.success events for {succeeded} succeeded episodes"),
    );
    let failures = world.telemetry.count("optimization.failed");
    checker.check(
        failures == escalated,
        format!("{failures} optimization.failed events for {escalated} escalated episodes"),
    );
}
