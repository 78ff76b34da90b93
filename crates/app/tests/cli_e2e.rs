//! Drives the `lk` binary against the in-process cloud simulator.

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cloud_sim::{CLAIMED_KEY, CloudSim, Faults};
use serde_json::Value;
use tempfile::TempDir;

const API_KEY: &str = "APIe2e";
const API_SECRET: &str = "e2e-secret-with-enough-length";

const SCRUBBED_ENV: [&str; 10] = [
    "LIVEKIT_URL",
    "LIVEKIT_API_KEY",
    "LIVEKIT_API_SECRET",
    "LK_CLOUD_API_URL",
    "LK_DASHBOARD_URL",
    "LK_SERVICE_URL",
    "LK_AUTH_POLL_INTERVAL_SECS",
    "LK_AUTH_TIMEOUT_SECS",
    "LK_TEMPLATES_INDEX_URL",
    "RUST_LOG",
];

/// One `lk` invocation with an isolated config directory.
struct Lk<'a> {
    config_dir: &'a Path,
    cwd: Option<&'a Path>,
    sim: Option<&'a CloudSim>,
    vars: Vec<(&'static str, String)>,
}

impl<'a> Lk<'a> {
    fn new(config_dir: &'a Path) -> Self {
        Self {
            config_dir,
            cwd: None,
            sim: None,
            vars: Vec::new(),
        }
    }

    fn against(mut self, sim: &'a CloudSim) -> Self {
        self.sim = Some(sim);
        self
    }

    fn in_dir(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    fn env(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.vars.push((name, value.into()));
        self
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut command = Command::new(env!("CARGO_BIN_EXE_lk"));
        command
            .args(args)
            .stdin(Stdio::null())
            .env("LK_CONFIG_DIR", self.config_dir);
        for name in SCRUBBED_ENV {
            command.env_remove(name);
        }
        if let Some(sim) = self.sim {
            command
                .env("LIVEKIT_URL", sim.ws_url())
                .env("LIVEKIT_API_KEY", API_KEY)
                .env("LIVEKIT_API_SECRET", API_SECRET)
                .env("LK_CLOUD_API_URL", sim.url());
        }
        for (name, value) in &self.vars {
            command.env(name, value);
        }
        if let Some(cwd) = self.cwd {
            command.current_dir(cwd);
        }
        command.output().expect("spawn lk")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "lk failed with {:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        stdout(output),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn project_add_and_switch_default() {
    let config = TempDir::new().unwrap();
    let lk = Lk::new(config.path());

    for (name, url) in [("alpha", "wss://alpha.livekit.cloud"), ("beta", "wss://beta.livekit.cloud")] {
        let added = lk.run(&[
            "project",
            "add",
            name,
            "--url",
            url,
            "--api-key",
            API_KEY,
            "--api-secret",
            API_SECRET,
        ]);
        assert_ok(&added);
        assert!(stdout(&added).contains(&format!("Saved project {name}")));
    }

    let switched = lk.run(&["project", "set-default", "beta"]);
    assert_ok(&switched);

    let listed = lk.run(&["project", "list", "--json"]);
    assert_ok(&listed);
    let rows: Vec<Value> = serde_json::from_str(&stdout(&listed)).unwrap();
    let defaults: Vec<&str> = rows
        .iter()
        .filter(|row| row["default"] == true)
        .map(|row| row["name"].as_str().unwrap())
        .collect();
    assert_eq!(defaults, vec!["beta"]);

    let stored = fs::read_to_string(config.path().join("cli-config.toml")).unwrap();
    assert!(stored.contains("alpha") && stored.contains("beta"));
}

#[test]
fn unknown_default_project_is_rejected() {
    let config = TempDir::new().unwrap();
    let output = Lk::new(config.path()).run(&["project", "set-default", "ghost"]);
    assert!(!output.status.success());
}

#[test]
fn token_identity_template_is_expanded() {
    let config = TempDir::new().unwrap();
    let output = Lk::new(config.path()).run(&[
        "token",
        "create",
        "--join",
        "--room",
        "standup",
        "--identity",
        "bot-{.}",
        "--api-key",
        API_KEY,
        "--api-secret",
        API_SECRET,
    ]);
    assert_ok(&output);
    let text = stdout(&output);
    let jwt = text
        .lines()
        .find_map(|line| line.strip_prefix("Access token: "))
        .expect("token line");
    let payload = jwt.split('.').nth(1).expect("jwt payload");
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();

    let identity = claims["sub"].as_str().unwrap();
    let suffix = identity.strip_prefix("bot-").expect("templated identity");
    assert!(!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(claims["iss"], API_KEY);
    assert_eq!(claims["video"]["room"], "standup");
    assert_eq!(claims["video"]["roomJoin"], true);
}

#[test]
fn agent_create_uploads_builds_and_binds_the_directory() {
    let sim = CloudSim::start().unwrap();
    let config = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("requirements.txt"), "livekit-agents>=1.2\n").unwrap();
    fs::write(source.path().join("agent.py"), "print('hello')\n").unwrap();
    fs::write(
        source.path().join("Dockerfile"),
        "FROM python:3.11-slim\nUSER appuser\nCOPY . .\n",
    )
    .unwrap();

    let output = Lk::new(config.path())
        .against(&sim)
        .in_dir(source.path())
        .run(&["agent", "create", "--name", "greeter", "--region", "us-east"]);
    assert_ok(&output);

    let agent = sim.state().agent_named("greeter").expect("agent registered");
    assert!(stdout(&output).contains(&format!("Created agent [greeter] with ID [{}]", agent.agent_id)));
    assert_eq!(agent.regions, vec!["us-east"]);

    let uploads = sim.state().uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].agent_id, agent.agent_id);

    let calls = sim.state().calls();
    let create = calls.iter().position(|c| c == "CloudAgent/CreateAgent").unwrap();
    let build = calls.iter().position(|c| c == "CloudAgent/BuildAgent").unwrap();
    assert!(create < build);

    let bound = fs::read_to_string(source.path().join("livekit.toml")).unwrap();
    assert!(bound.contains(&agent.agent_id));
}

#[test]
fn agent_create_refuses_an_outdated_sdk() {
    let sim = CloudSim::start().unwrap();
    let config = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(source.path().join("requirements.txt"), "livekit-agents==0.8.2\n").unwrap();

    let output = Lk::new(config.path())
        .against(&sim)
        .in_dir(source.path())
        .run(&["agent", "create", "--name", "legacy", "--silent"]);
    assert!(!output.status.success());
    assert!(sim.state().agent_named("legacy").is_none());
    assert!(!source.path().join("livekit.toml").exists());
}

#[test]
fn load_test_on_a_grid_layout_reports_a_total() {
    let config = TempDir::new().unwrap();
    let output = Lk::new(config.path()).run(&[
        "perf",
        "load-test",
        "--room",
        "bench",
        "--layout",
        "3x3",
        "--video-publishers",
        "4",
        "--subscribers",
        "8",
        "--num-per-second",
        "5",
        "--duration",
        "2s",
        "--seed",
        "7",
        "--api-key",
        API_KEY,
        "--api-secret",
        API_SECRET,
    ]);
    assert_ok(&output);
    let text = stdout(&output);
    assert!(text.contains("Running load test in room bench on the in-process simulated network"));
    assert!(text.contains("Tester"));
    assert!(text.lines().any(|line| line.starts_with("Total")));
}

#[test]
fn private_link_health_failures_do_not_hide_other_links() {
    let sim = CloudSim::start().unwrap();
    sim.state()
        .seed_private_link("db", "us-east", 5432, "db.internal");
    let broken = sim
        .state()
        .seed_private_link("cache", "us-east", 6379, "cache.internal");
    sim.state().fail_health_of(&broken);

    let config = TempDir::new().unwrap();
    let output = Lk::new(config.path())
        .against(&sim)
        .run(&["agent", "private-link", "list"]);
    assert_ok(&output);
    let text = stdout(&output);
    let healthy = text.lines().find(|l| l.contains("db.internal")).unwrap();
    let failing = text.lines().find(|l| l.contains("cache.internal")).unwrap();
    assert!(healthy.contains("HEALTHY"));
    assert!(failing.contains("ERROR"));
}

#[test]
fn rollback_latest_is_sent_verbatim() {
    let sim = CloudSim::start().unwrap();
    let agent_id = sim.state().seed_agent("support", &["v1", "v2"]);
    let config = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(
        source.path().join("livekit.toml"),
        format!("[project]\nsubdomain = \"sim\"\n\n[agent]\nname = \"support\"\nid = \"{agent_id}\"\n"),
    )
    .unwrap();

    let output = Lk::new(config.path())
        .against(&sim)
        .in_dir(source.path())
        .run(&["agent", "rollback", "--version", "latest"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("Rolled back agent [support] to version latest"));
    assert_eq!(
        sim.state().rollbacks(),
        vec![(agent_id.clone(), "latest".to_string())]
    );
    assert_eq!(sim.state().agent(&agent_id).unwrap().current, "v1");
}

#[test]
fn agent_update_sends_settings_and_secrets() {
    let sim = CloudSim::start().unwrap();
    let agent_id = sim.state().seed_agent("support", &["v1"]);
    let config = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(
        source.path().join("livekit.toml"),
        format!(
            "[project]\nsubdomain = \"sim\"\n\n[agent]\nname = \"support\"\nid = \"{agent_id}\"\ncpu = \"2\"\nreplicas = 2\nmax_replicas = 4\n"
        ),
    )
    .unwrap();
    let env_file = source.path().join(".env.agent");
    fs::write(&env_file, "REDIS_URL=redis://cache:6379\n").unwrap();

    let output = Lk::new(config.path())
        .against(&sim)
        .in_dir(source.path())
        .run(&[
            "agent",
            "update",
            "--secrets",
            "OPENAI_API_KEY=sk-test",
            "--secrets-file",
            env_file.to_str().unwrap(),
        ]);
    assert_ok(&output);
    assert!(stdout(&output).contains("Updated agent [support]"));

    let agent = sim.state().agent(&agent_id).unwrap();
    assert_eq!((agent.replicas, agent.max_replicas), (2, 4));
    assert_eq!(agent.cpu_req, "2");
    assert_eq!(
        agent.secrets.into_iter().collect::<Vec<_>>(),
        vec!["OPENAI_API_KEY".to_string(), "REDIS_URL".to_string()]
    );
    let calls = sim.state().calls();
    assert!(calls.contains(&"CloudAgent/UpdateAgent".to_string()));
    assert!(!calls.contains(&"CloudAgent/BuildAgent".to_string()));
    assert!(sim.state().uploads().is_empty());
}

#[test]
fn device_auth_stores_and_revokes_the_claimed_project() {
    let sim = CloudSim::start_with(Faults {
        pending_claims: 1,
        ..Faults::default()
    })
    .unwrap();
    let config = TempDir::new().unwrap();
    // An empty PATH keeps the browser launcher from starting.
    let no_tools = TempDir::new().unwrap();
    let lk = Lk::new(config.path())
        .against(&sim)
        .env("PATH", no_tools.path().to_string_lossy())
        .env("LK_AUTH_POLL_INTERVAL_SECS", "1")
        .env("LK_AUTH_TIMEOUT_SECS", "30");

    let authed = lk.run(&["cloud", "auth"]);
    assert_ok(&authed);
    assert!(stdout(&authed).contains("Authenticated project"));
    let stored = fs::read_to_string(config.path().join("cli-config.toml")).unwrap();
    assert!(stored.contains(CLAIMED_KEY));
    assert!(stored.contains("default_project"));

    let revoked = lk.run(&["auth", "--revoke"]);
    assert_ok(&revoked);
    assert_eq!(sim.state().revocations(), 1);
    let stored = fs::read_to_string(config.path().join("cli-config.toml")).unwrap();
    assert!(!stored.contains(CLAIMED_KEY));
}

#[test]
fn denied_device_auth_fails_without_storing() {
    let sim = CloudSim::start_with(Faults {
        deny_claims: true,
        ..Faults::default()
    })
    .unwrap();
    let config = TempDir::new().unwrap();
    let no_tools = TempDir::new().unwrap();
    let output = Lk::new(config.path())
        .against(&sim)
        .env("PATH", no_tools.path().to_string_lossy())
        .env("LK_AUTH_POLL_INTERVAL_SECS", "1")
        .run(&["cloud", "auth"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("access denied"));
    assert!(!config.path().join("cli-config.toml").exists());
}
