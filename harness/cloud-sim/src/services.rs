//! Behaviour of the simulated Twirp services. Every function takes the
//! decoded request body and answers with the JSON the real service would.

use std::collections::BTreeSet;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::SimError;
use crate::state::{Inner, PrivateLink, SimAgent};

type Reply = Result<Value, SimError>;

fn text<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn required<'a>(body: &'a Value, key: &str) -> Result<&'a str, SimError> {
    match text(body, key) {
        "" => Err(SimError::InvalidArgument(format!("{key} is required"))),
        value => Ok(value),
    }
}

fn strings(body: &Value, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn number(body: &Value, key: &str, default: u32) -> u32 {
    body.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(default)
}

fn secret_names(body: &Value) -> BTreeSet<String> {
    body.get("secrets")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|s| text(s, "name").to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn ack(success: bool, message: &str) -> Value {
    json!({ "success": success, "message": message })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn dispatch(inner: &mut Inner, service: &str, method: &str, body: &Value) -> Reply {
    inner.calls.push(format!("{service}/{method}"));
    debug!(service, method, "twirp call");
    match service {
        "CloudAgent" => cloud_agent(inner, method, body),
        "RoomService" => room_service(inner, method, body),
        "SIP" => sip(inner, method, body),
        "PhoneNumberService" => phone_numbers(inner, method, body),
        _ => Err(SimError::BadRoute(format!("{service}/{method}"))),
    }
}

fn agent_mut<'a>(inner: &'a mut Inner, body: &Value) -> Result<&'a mut SimAgent, SimError> {
    let id = required(body, "agent_id")?;
    inner
        .agents
        .get_mut(id)
        .ok_or_else(|| SimError::NotFound(format!("agent {id}")))
}

fn agent_view(agent: &SimAgent) -> Value {
    let deployments: Vec<Value> = agent
        .regions
        .iter()
        .map(|region| {
            json!({
                "region": region,
                "agent_id": agent.agent_id,
                "status": "Running",
                "replicas": agent.replicas,
                "min_replicas": agent.replicas,
                "max_replicas": agent.max_replicas,
                "cpu_req": agent.cpu_req,
                "cur_cpu": "0.1",
                "mem_req": "2GB",
                "cur_mem": "0.4GB",
            })
        })
        .collect();
    let secrets: Vec<Value> = agent.secrets.iter().map(|s| json!({ "name": s })).collect();
    json!({
        "agent_id": agent.agent_id,
        "agent_name": agent.agent_name,
        "version": agent.current,
        "deployed_at": now(),
        "agent_deployments": deployments,
        "secrets": secrets,
    })
}

fn next_version(agent: &SimAgent) -> String {
    format!("v{}", agent.versions.len() + 1)
}

fn cloud_agent(inner: &mut Inner, method: &str, body: &Value) -> Reply {
    match method {
        "GetClientSettings" => Ok(json!({ "params": inner.client_settings })),
        "CreateAgent" => {
            let name = required(body, "agent_name")?.to_string();
            if inner.agents.values().any(|a| a.agent_name == name) {
                return Err(SimError::AlreadyExists(format!("agent {name}")));
            }
            let agent_id = inner.next_id("CA");
            let secrets = secret_names(body);
            let version = "v1".to_string();
            inner.agents.insert(
                agent_id.clone(),
                SimAgent {
                    agent_id: agent_id.clone(),
                    agent_name: name.clone(),
                    versions: vec![version.clone()],
                    current: version.clone(),
                    replicas: number(body, "replicas", 1),
                    max_replicas: number(body, "max_replicas", 10),
                    cpu_req: text(body, "cpu_req").to_string(),
                    regions: strings(body, "regions"),
                    secrets,
                },
            );
            Ok(json!({
                "agent_id": agent_id,
                "agent_name": name,
                "version": version,
                "presigned_url": inner.upload_url(&agent_id, &version),
            }))
        }
        "DeployAgent" => {
            let agent = agent_mut(inner, body)?;
            let version = next_version(agent);
            agent.versions.push(version.clone());
            agent.current = version.clone();
            let agent_id = agent.agent_id.clone();
            Ok(json!({
                "agent_id": agent_id,
                "version": version,
                "presigned_url": inner.upload_url(&agent_id, &version),
            }))
        }
        "BuildAgent" => {
            let (agent_id, version) = {
                let agent = agent_mut(inner, body)?;
                (agent.agent_id.clone(), agent.current.clone())
            };
            let uploaded = inner
                .uploads
                .iter()
                .any(|u| u.agent_id == agent_id && u.version == version);
            if !uploaded {
                return Err(SimError::FailedPrecondition(format!(
                    "no source uploaded for {agent_id} {version}"
                )));
            }
            Ok(ack(true, ""))
        }
        "UpdateAgent" => {
            let agent = agent_mut(inner, body)?;
            agent.replicas = number(body, "replicas", agent.replicas);
            agent.max_replicas = number(body, "max_replicas", agent.max_replicas);
            let cpu = text(body, "cpu_req");
            if !cpu.is_empty() {
                agent.cpu_req = cpu.to_string();
            }
            let regions = strings(body, "regions");
            if !regions.is_empty() {
                agent.regions = regions;
            }
            agent.secrets.extend(secret_names(body));
            Ok(ack(true, ""))
        }
        "RollbackAgent" => {
            let requested = required(body, "version")?.to_string();
            let agent = agent_mut(inner, body)?;
            let target = if requested == "latest" {
                let position = agent.versions.iter().position(|v| *v == agent.current);
                match position {
                    Some(idx) if idx > 0 => agent.versions[idx - 1].clone(),
                    _ => return Ok(ack(false, "no earlier version to roll back to")),
                }
            } else if agent.versions.contains(&requested) {
                requested.clone()
            } else {
                return Ok(ack(false, &format!("no such version {requested}")));
            };
            agent.current = target;
            let agent_id = agent.agent_id.clone();
            inner.rollbacks.push((agent_id, requested));
            Ok(ack(true, ""))
        }
        "DeleteAgent" => {
            let id = required(body, "agent_id")?;
            inner
                .agents
                .remove(id)
                .ok_or_else(|| SimError::NotFound(format!("agent {id}")))?;
            Ok(ack(true, ""))
        }
        "ListAgents" => {
            let id = text(body, "agent_id");
            let agents: Vec<Value> = inner
                .agents
                .values()
                .filter(|a| id.is_empty() || a.agent_id == id)
                .map(agent_view)
                .collect();
            Ok(json!({ "agents": agents }))
        }
        "ListAgentVersions" => {
            let agent = agent_mut(inner, body)?;
            let versions: Vec<Value> = agent
                .versions
                .iter()
                .rev()
                .map(|v| {
                    json!({
                        "version": v,
                        "current": *v == agent.current,
                        "created_at": now(),
                        "deployed_at": now(),
                    })
                })
                .collect();
            Ok(json!({ "versions": versions }))
        }
        "ListAgentSecrets" => {
            let agent = agent_mut(inner, body)?;
            let secrets: Vec<Value> = agent.secrets.iter().map(|s| json!({ "name": s })).collect();
            Ok(json!({ "secrets": secrets }))
        }
        "UpdateAgentSecrets" => {
            let overwrite = body.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
            let names = secret_names(body);
            let agent = agent_mut(inner, body)?;
            if overwrite {
                agent.secrets = names;
            } else {
                agent.secrets.extend(names);
            }
            Ok(ack(true, ""))
        }
        "CreatePrivateLink" => {
            let link = PrivateLink {
                private_link_id: inner.next_id("PL"),
                name: required(body, "name")?.to_string(),
                region: text(body, "region").to_string(),
                port: number(body, "port", 0),
                endpoint: text(body, "endpoint").to_string(),
            };
            inner.private_links.push(link.clone());
            Ok(json!({ "private_link": link }))
        }
        "ListPrivateLinks" => Ok(json!({ "private_links": inner.private_links })),
        "DeletePrivateLink" => {
            let id = required(body, "private_link_id")?;
            let before = inner.private_links.len();
            inner.private_links.retain(|l| l.private_link_id != id);
            if inner.private_links.len() == before {
                return Err(SimError::NotFound(format!("private link {id}")));
            }
            Ok(ack(true, ""))
        }
        "GetPrivateLinkHealthStatus" => {
            let id = required(body, "private_link_id")?;
            if inner.faults.failing_health.contains(id) {
                return Err(SimError::Injected(format!("health of {id} unavailable")));
            }
            if !inner.private_links.iter().any(|l| l.private_link_id == id) {
                return Err(SimError::NotFound(format!("private link {id}")));
            }
            Ok(json!({ "status": "HEALTHY", "updated_at": now() }))
        }
        _ => Err(SimError::BadRoute(format!("CloudAgent/{method}"))),
    }
}

fn room_service(inner: &mut Inner, method: &str, body: &Value) -> Reply {
    match method {
        "CreateRoom" => {
            let name = required(body, "name")?.to_string();
            if let Some(room) = inner.rooms.get(&name) {
                return Ok(room.clone());
            }
            let room = json!({
                "sid": inner.next_id("RM"),
                "name": name,
                "empty_timeout": number(body, "empty_timeout", 300),
                "departure_timeout": number(body, "departure_timeout", 20),
                "max_participants": number(body, "max_participants", 0),
                "creation_time": chrono::Utc::now().timestamp().to_string(),
                "metadata": text(body, "metadata"),
                "num_participants": 0,
                "num_publishers": 0,
                "active_recording": false,
            });
            inner.rooms.insert(name, room.clone());
            Ok(room)
        }
        "ListRooms" => {
            let names = strings(body, "names");
            let rooms: Vec<&Value> = inner
                .rooms
                .iter()
                .filter(|(name, _)| names.is_empty() || names.contains(name))
                .map(|(_, room)| room)
                .collect();
            Ok(json!({ "rooms": rooms }))
        }
        "DeleteRoom" => {
            let name = required(body, "room")?;
            inner
                .rooms
                .remove(name)
                .ok_or_else(|| SimError::NotFound(format!("room {name}")))?;
            Ok(json!({}))
        }
        "UpdateRoomMetadata" => {
            let name = required(body, "room")?;
            let metadata = text(body, "metadata").to_string();
            let room = inner
                .rooms
                .get_mut(name)
                .ok_or_else(|| SimError::NotFound(format!("room {name}")))?;
            room["metadata"] = Value::String(metadata);
            Ok(room.clone())
        }
        "ListParticipants" => {
            let name = required(body, "room")?;
            if !inner.rooms.contains_key(name) {
                return Err(SimError::NotFound(format!("room {name}")));
            }
            Ok(json!({ "participants": [] }))
        }
        _ => Err(SimError::BadRoute(format!("RoomService/{method}"))),
    }
}

fn sip(inner: &mut Inner, method: &str, body: &Value) -> Reply {
    match method {
        "CreateSIPInboundTrunk" => {
            let mut trunk = body.get("trunk").cloned().unwrap_or_else(|| json!({}));
            trunk["sip_trunk_id"] = Value::String(inner.next_id("ST"));
            inner.inbound_trunks.push(trunk.clone());
            Ok(trunk)
        }
        "ListSIPInboundTrunk" => Ok(json!({ "items": inner.inbound_trunks })),
        "DeleteSIPTrunk" => {
            let id = required(body, "sip_trunk_id")?;
            let before = inner.inbound_trunks.len();
            inner.inbound_trunks.retain(|t| text(t, "sip_trunk_id") != id);
            if inner.inbound_trunks.len() == before {
                return Err(SimError::NotFound(format!("trunk {id}")));
            }
            Ok(json!({}))
        }
        "CreateSIPDispatchRule" => {
            let mut rule = body.get("dispatch_rule").cloned().unwrap_or_else(|| json!({}));
            rule["sip_dispatch_rule_id"] = Value::String(inner.next_id("SDR"));
            inner.dispatch_rules.push(rule.clone());
            Ok(rule)
        }
        "UpdateSIPDispatchRule" => {
            let id = required(body, "sip_dispatch_rule_id")?.to_string();
            let mut replacement = body.get("replace").cloned().unwrap_or_else(|| json!({}));
            replacement["sip_dispatch_rule_id"] = Value::String(id.clone());
            let slot = inner
                .dispatch_rules
                .iter_mut()
                .find(|r| text(r, "sip_dispatch_rule_id") == id)
                .ok_or_else(|| SimError::NotFound(format!("dispatch rule {id}")))?;
            *slot = replacement.clone();
            Ok(replacement)
        }
        "ListSIPDispatchRule" => Ok(json!({ "items": inner.dispatch_rules })),
        "DeleteSIPDispatchRule" => {
            let id = required(body, "sip_dispatch_rule_id")?;
            let before = inner.dispatch_rules.len();
            inner
                .dispatch_rules
                .retain(|r| text(r, "sip_dispatch_rule_id") != id);
            if inner.dispatch_rules.len() == before {
                return Err(SimError::NotFound(format!("dispatch rule {id}")));
            }
            Ok(json!({}))
        }
        _ => Err(SimError::BadRoute(format!("SIP/{method}"))),
    }
}

fn phone_numbers(inner: &mut Inner, method: &str, body: &Value) -> Reply {
    match method {
        "SearchPhoneNumbers" => {
            let country = required(body, "country_code")?.to_ascii_uppercase();
            let area = match text(body, "area_code") {
                "" => "415",
                area => area,
            };
            let limit = number(body, "limit", 3).min(20);
            let items: Vec<Value> = (0..limit)
                .map(|i| {
                    json!({
                        "e164_format": format!("+1{area}55501{i:02}"),
                        "country_code": country,
                        "area_code": area,
                        "number_type": "local",
                        "locality": "San Francisco",
                        "region": "CA",
                        "capabilities": ["voice"],
                        "status": "available",
                    })
                })
                .collect();
            Ok(json!({ "items": items }))
        }
        "PurchasePhoneNumber" => {
            let requested = strings(body, "phone_numbers");
            if requested.is_empty() {
                return Err(SimError::InvalidArgument("phone_numbers is required".into()));
            }
            let mut purchased = Vec::new();
            for e164 in requested {
                let number = json!({
                    "id": inner.next_id("PN"),
                    "e164_format": e164,
                    "country_code": "US",
                    "number_type": "local",
                    "capabilities": ["voice"],
                    "status": "active",
                });
                inner.phone_numbers.push(number.clone());
                purchased.push(number);
            }
            Ok(json!({ "phone_numbers": purchased }))
        }
        "ListPhoneNumbers" => Ok(json!({ "items": inner.phone_numbers })),
        "GetPhoneNumber" => {
            let id = required(body, "id")?;
            inner
                .phone_numbers
                .iter()
                .find(|n| text(n, "id") == id)
                .map(|n| json!({ "phone_number": n }))
                .ok_or_else(|| SimError::NotFound(format!("phone number {id}")))
        }
        "ReleasePhoneNumbers" => {
            let ids = strings(body, "ids");
            inner
                .phone_numbers
                .retain(|n| !ids.iter().any(|id| id == text(n, "id")));
            Ok(json!({}))
        }
        _ => Err(SimError::BadRoute(format!("PhoneNumberService/{method}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Faults, SimState};

    fn call(state: &SimState, service: &str, method: &str, body: Value) -> Reply {
        state.with(|inner| dispatch(inner, service, method, &body))
    }

    #[test]
    fn rollback_to_latest_picks_the_previous_version() {
        let state = SimState::new("http://sim", Faults::default());
        let id = state.seed_agent("support", &["v1", "v2", "v3"]);
        let reply = call(
            &state,
            "CloudAgent",
            "RollbackAgent",
            json!({ "agent_id": id, "version": "latest" }),
        )
        .unwrap();
        assert_eq!(reply["success"], true);
        assert_eq!(state.agent(&id).unwrap().current, "v2");
        assert_eq!(state.rollbacks(), vec![(id, "latest".to_string())]);
    }

    #[test]
    fn rollback_without_history_is_refused() {
        let state = SimState::new("http://sim", Faults::default());
        let id = state.seed_agent("fresh", &["v1"]);
        let reply = call(
            &state,
            "CloudAgent",
            "RollbackAgent",
            json!({ "agent_id": id, "version": "latest" }),
        )
        .unwrap();
        assert_eq!(reply["success"], false);
        assert!(state.rollbacks().is_empty());
    }

    #[test]
    fn build_requires_an_upload() {
        let state = SimState::new("http://sim", Faults::default());
        let created = call(
            &state,
            "CloudAgent",
            "CreateAgent",
            json!({ "agent_name": "greeter" }),
        )
        .unwrap();
        assert_eq!(
            created["presigned_url"],
            format!("http://sim/uploads/{}/v1", created["agent_id"].as_str().unwrap())
        );
        let err = call(
            &state,
            "CloudAgent",
            "BuildAgent",
            json!({ "agent_id": created["agent_id"] }),
        )
        .unwrap_err();
        assert!(matches!(err, SimError::FailedPrecondition(_)));
    }

    #[test]
    fn injected_health_failure_only_hits_that_link() {
        let state = SimState::new("http://sim", Faults::default());
        let healthy = state.seed_private_link("db", "us-east", 5432, "db.internal");
        let broken = state.seed_private_link("cache", "us-east", 6379, "cache.internal");
        state.fail_health_of(&broken);
        assert!(
            call(
                &state,
                "CloudAgent",
                "GetPrivateLinkHealthStatus",
                json!({ "private_link_id": healthy })
            )
            .is_ok()
        );
        assert!(matches!(
            call(
                &state,
                "CloudAgent",
                "GetPrivateLinkHealthStatus",
                json!({ "private_link_id": broken })
            ),
            Err(SimError::Injected(_))
        ));
    }

    #[test]
    fn unknown_service_is_a_bad_route() {
        let state = SimState::new("http://sim", Faults::default());
        assert!(matches!(
            call(&state, "Nope", "Do", json!({})),
            Err(SimError::BadRoute(_))
        ));
    }
}
