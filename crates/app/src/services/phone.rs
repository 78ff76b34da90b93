use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::sip::{SipClient, SipDispatchRule};
use super::{Grants, TwirpClient};
use crate::error::CliError;
use crate::fanout::join2;

const SERVICE: &str = "PhoneNumberService";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneNumber {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub e164_format: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub area_code: String,
    #[serde(default)]
    pub number_type: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub status: String,
    /// Legacy single association; read for compatibility, never written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sip_dispatch_rule_id: Option<String>,
    /// Rules whose `trunk_ids` reference this number.
    #[serde(default)]
    pub sip_dispatch_rule_ids: Vec<String>,
}

impl PhoneNumber {
    /// Rebuild the association list from the rules that reference this number.
    fn reconcile(&mut self, rules: &[SipDispatchRule]) {
        let mut ids: Vec<String> = rules
            .iter()
            .filter(|rule| rule.trunk_ids.iter().any(|t| t == &self.id))
            .map(|rule| rule.sip_dispatch_rule_id.clone())
            .collect();
        if ids.is_empty()
            && let Some(legacy) = self.sip_dispatch_rule_id.as_ref().filter(|s| !s.is_empty())
        {
            ids.push(legacy.clone());
        }
        ids.sort();
        ids.dedup();
        self.sip_dispatch_rule_ids = ids;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchQuery {
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<PhoneNumber>,
}

#[derive(Debug, Deserialize, Default)]
struct PurchaseResponse {
    #[serde(default)]
    phone_numbers: Vec<PhoneNumber>,
}

#[derive(Debug, Deserialize, Default)]
struct GetResponse {
    phone_number: PhoneNumber,
}

#[derive(Debug, Deserialize, Default)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct PhoneNumberClient {
    twirp: TwirpClient,
    sip: SipClient,
}

impl PhoneNumberClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self {
            sip: SipClient::new(twirp.clone()),
            twirp,
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<PhoneNumber>, CliError> {
        let resp: ItemsResponse =
            self.twirp
                .call(SERVICE, "SearchPhoneNumbers", &Grants::sip_admin(), query)?;
        Ok(resp.items)
    }

    fn list_raw(&self) -> Result<Vec<PhoneNumber>, CliError> {
        let resp: ItemsResponse =
            self.twirp
                .call(SERVICE, "ListPhoneNumbers", &Grants::sip_admin(), &json!({}))?;
        Ok(resp.items)
    }

    fn get_raw(&self, id: &str) -> Result<PhoneNumber, CliError> {
        let resp: GetResponse = self.twirp.call(
            SERVICE,
            "GetPhoneNumber",
            &Grants::sip_admin(),
            &json!({ "id": id }),
        )?;
        Ok(resp.phone_number)
    }

    fn purchase_raw(&self, numbers: &[String]) -> Result<Vec<PhoneNumber>, CliError> {
        let resp: PurchaseResponse = self.twirp.call(
            SERVICE,
            "PurchasePhoneNumber",
            &Grants::sip_admin(),
            &json!({ "phone_numbers": numbers }),
        )?;
        Ok(resp.phone_numbers)
    }

    pub fn release(&self, ids: &[String]) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "ReleasePhoneNumbers",
            &Grants::sip_admin(),
            &json!({ "ids": ids }),
        )?;
        Ok(())
    }

    /// Rules lookup runs alongside the primary call.
    pub async fn list(&self) -> Result<Vec<PhoneNumber>> {
        let numbers = self.clone();
        let rules = self.sip.clone();
        let (mut items, rules) = join2(
            move || numbers.list_raw().context("unable to list phone numbers"),
            move || rules.list_dispatch_rules().context("unable to list dispatch rules"),
        )
        .await?;
        for item in &mut items {
            item.reconcile(&rules);
        }
        Ok(items)
    }

    pub async fn get(&self, id: &str) -> Result<PhoneNumber> {
        let numbers = self.clone();
        let rules = self.sip.clone();
        let id_owned = id.to_string();
        let (mut number, rules) = join2(
            move || numbers.get_raw(&id_owned).context("unable to get phone number"),
            move || rules.list_dispatch_rules().context("unable to list dispatch rules"),
        )
        .await?;
        number.reconcile(&rules);
        Ok(number)
    }

    /// Buys `numbers`; when `dispatch_rule_id` is given the new numbers are
    /// appended to that rule's trunk list.
    pub async fn purchase(
        &self,
        numbers: Vec<String>,
        dispatch_rule_id: Option<String>,
    ) -> Result<Vec<PhoneNumber>> {
        let buyer = self.clone();
        let rules_client = self.sip.clone();
        let (mut purchased, rules) = join2(
            move || {
                buyer
                    .purchase_raw(&numbers)
                    .context("unable to purchase phone numbers")
            },
            move || {
                rules_client
                    .list_dispatch_rules()
                    .context("unable to list dispatch rules")
            },
        )
        .await?;
        let mut rules = rules;
        if let Some(rule_id) = dispatch_rule_id {
            let ids: Vec<String> = purchased.iter().map(|n| n.id.clone()).collect();
            let updated = self.attach(&rules, &rule_id, &ids)?;
            replace_rule(&mut rules, updated);
        }
        for number in &mut purchased {
            number.reconcile(&rules);
        }
        Ok(purchased)
    }

    /// Associates a number with a dispatch rule by appending to the rule's
    /// trunk list. The number's legacy field is left alone.
    pub async fn update(&self, id: &str, dispatch_rule_id: &str) -> Result<PhoneNumber> {
        let numbers = self.clone();
        let rules_client = self.sip.clone();
        let id_owned = id.to_string();
        let (mut number, mut rules) = join2(
            move || numbers.get_raw(&id_owned).context("unable to get phone number"),
            move || {
                rules_client
                    .list_dispatch_rules()
                    .context("unable to list dispatch rules")
            },
        )
        .await?;
        let updated = self.attach(&rules, dispatch_rule_id, std::slice::from_ref(&number.id))?;
        replace_rule(&mut rules, updated);
        number.reconcile(&rules);
        Ok(number)
    }

    fn attach(
        &self,
        rules: &[SipDispatchRule],
        rule_id: &str,
        number_ids: &[String],
    ) -> Result<SipDispatchRule> {
        let mut rule = rules
            .iter()
            .find(|r| r.sip_dispatch_rule_id == rule_id)
            .cloned()
            .ok_or_else(|| CliError::NotFound(format!("dispatch rule `{rule_id}`")))?;
        let before = rule.trunk_ids.len();
        for id in number_ids {
            if !rule.trunk_ids.contains(id) {
                rule.trunk_ids.push(id.clone());
            }
        }
        if rule.trunk_ids.len() == before {
            debug!(rule_id, "dispatch rule already references number");
            return Ok(rule);
        }
        self.sip
            .update_dispatch_rule(&rule)
            .context("unable to update dispatch rule")
    }
}

fn replace_rule(rules: &mut [SipDispatchRule], updated: SipDispatchRule) {
    if let Some(slot) = rules
        .iter_mut()
        .find(|r| r.sip_dispatch_rule_id == updated.sip_dispatch_rule_id)
    {
        *slot = updated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, trunks: &[&str]) -> SipDispatchRule {
        SipDispatchRule {
            sip_dispatch_rule_id: id.into(),
            trunk_ids: trunks.iter().map(|s| s.to_string()).collect(),
            ..SipDispatchRule::default()
        }
    }

    #[test]
    fn reconcile_prefers_rule_membership() {
        let mut number = PhoneNumber {
            id: "PN_1".into(),
            sip_dispatch_rule_id: Some("SDR_legacy".into()),
            ..PhoneNumber::default()
        };
        number.reconcile(&[rule("SDR_b", &["PN_1"]), rule("SDR_a", &["PN_1", "PN_2"])]);
        assert_eq!(number.sip_dispatch_rule_ids, vec!["SDR_a", "SDR_b"]);
    }

    #[test]
    fn reconcile_falls_back_to_legacy_field() {
        let mut number = PhoneNumber {
            id: "PN_9".into(),
            sip_dispatch_rule_id: Some("SDR_old".into()),
            ..PhoneNumber::default()
        };
        number.reconcile(&[rule("SDR_a", &["PN_1"])]);
        assert_eq!(number.sip_dispatch_rule_ids, vec!["SDR_old"]);
    }

    #[test]
    fn legacy_field_is_not_serialized_when_absent() {
        let number = PhoneNumber {
            id: "PN_1".into(),
            ..PhoneNumber::default()
        };
        let json = serde_json::to_value(&number).unwrap();
        assert!(json.get("sip_dispatch_rule_id").is_none());
    }
}
