use cloud_sim::{CloudSim, Faults};
use serde_json::{Value, json};

fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

fn rpc(sim: &CloudSim, service: &str, method: &str, body: Value) -> (u16, Value) {
    let mut response = agent()
        .post(&format!("{}/twirp/livekit.{service}/{method}", sim.url()))
        .header("Authorization", "Bearer contract")
        .send_json(body)
        .unwrap();
    let status = response.status().as_u16();
    (status, response.body_mut().read_json().unwrap())
}

fn gzip_bytes() -> Vec<u8> {
    vec![0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00]
}

#[test]
fn create_upload_build_and_follow_logs() {
    let sim = CloudSim::start().unwrap();
    let (status, created) = rpc(
        &sim,
        "CloudAgent",
        "CreateAgent",
        json!({ "agent_name": "greeter", "regions": ["us-east"] }),
    );
    assert_eq!(status, 200);
    let agent_id = created["agent_id"].as_str().unwrap().to_string();
    let presigned = created["presigned_url"].as_str().unwrap();

    let uploaded = agent()
        .put(presigned)
        .header("Content-Type", "application/gzip")
        .send(&gzip_bytes()[..])
        .unwrap();
    assert_eq!(uploaded.status().as_u16(), 200);

    let (status, _) = rpc(&sim, "CloudAgent", "BuildAgent", json!({ "agent_id": agent_id }));
    assert_eq!(status, 200);

    let logs = agent()
        .get(&format!("{}/agents/{agent_id}/logs/build", sim.url()))
        .header("Authorization", "Bearer contract")
        .call()
        .unwrap()
        .into_body()
        .read_to_string()
        .unwrap();
    let last = logs.lines().last().unwrap();
    let frame: Value = serde_json::from_str(last).unwrap();
    assert_eq!(frame["type"], "done");
    assert_eq!(frame["message"], "build complete");

    assert_eq!(sim.state().uploads().len(), 1);
    assert_eq!(
        sim.state().calls(),
        vec!["CloudAgent/CreateAgent", "CloudAgent/BuildAgent"]
    );
}

#[test]
fn first_upload_failure_is_transient() {
    let sim = CloudSim::start_with(Faults {
        upload_failures: 1,
        ..Faults::default()
    })
    .unwrap();
    let url = format!("{}/uploads/CA_0001/v1", sim.url());
    let first = agent().put(&url).send(&gzip_bytes()[..]).unwrap();
    assert_eq!(first.status().as_u16(), 503);
    let second = agent().put(&url).send(&gzip_bytes()[..]).unwrap();
    assert_eq!(second.status().as_u16(), 200);
}

#[test]
fn errors_use_the_twirp_shape() {
    let sim = CloudSim::start().unwrap();
    let (status, body) = rpc(
        &sim,
        "CloudAgent",
        "ListAgentVersions",
        json!({ "agent_id": "CA_missing" }),
    );
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");
    assert!(body["msg"].as_str().unwrap().contains("CA_missing"));
}

#[test]
fn revoke_counts_signed_requests() {
    let sim = CloudSim::start().unwrap();
    let unsigned = agent()
        .delete(&format!("{}/cli/revoke", sim.url()))
        .call()
        .unwrap();
    assert_eq!(unsigned.status().as_u16(), 401);
    let signed = agent()
        .delete(&format!("{}/cli/revoke", sim.url()))
        .header("Authorization", "Bearer jwt")
        .call()
        .unwrap();
    assert_eq!(signed.status().as_u16(), 200);
    assert_eq!(sim.state().revocations(), 1);
}

#[test]
fn rooms_round_trip_metadata() {
    let sim = CloudSim::start().unwrap();
    let (_, room) = rpc(&sim, "RoomService", "CreateRoom", json!({ "name": "lobby" }));
    assert_eq!(room["name"], "lobby");
    let (_, updated) = rpc(
        &sim,
        "RoomService",
        "UpdateRoomMetadata",
        json!({ "room": "lobby", "metadata": "{\"topic\":\"standup\"}" }),
    );
    assert_eq!(updated["metadata"], "{\"topic\":\"standup\"}");
    let (_, listed) = rpc(&sim, "RoomService", "ListRooms", json!({}));
    assert_eq!(listed["rooms"].as_array().unwrap().len(), 1);
}
