//! Remaining recipient counts per campaign, for the periodic queue
//! depth report.
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueMsg {
    pub queue: u64,
    pub domainqueues: BTreeMap<String, u64>,
    pub completecampaigns: Vec<String>,
}

type SendQueues = BTreeMap<String, BTreeMap<String, u64>>;

#[derive(Default)]
pub struct QueueStatus {
    by_campaign: Mutex<BTreeMap<String, SendQueues>>,
}

impl QueueStatus {
    /// Records how many recipients of `domain` are left in one send
    /// of a campaign. Negative counts are treated as zero.
    pub fn set(&self, campaign: &str, send_id: &str, domain: &str, remaining: i64) {
        let remaining = remaining.max(0) as u64;
        self.by_campaign
            .lock()
            .entry(campaign.to_string())
            .or_default()
            .entry(send_id.to_string())
            .or_default()
            .insert(domain.to_string(), remaining);
    }

    /// Totals the queue. A campaign with nothing left is reported as
    /// complete.
    pub fn report(&self) -> QueueMsg {
        let mut msg = QueueMsg::default();
        for (campaign, sends) in self.by_campaign.lock().iter() {
            let mut campaign_total = 0;
            for (domain, count) in sends.values().flat_map(|domains| domains.iter()) {
                msg.queue += count;
                *msg.domainqueues.entry(domain.clone()).or_default() += count;
                campaign_total += count;
            }
            if campaign_total == 0 {
                msg.completecampaigns.push(campaign.clone());
            }
        }
        msg
    }

    /// Drops campaigns once their completion has been reported
    pub fn forget(&self, campaigns: &[String]) {
        let mut by_campaign = self.by_campaign.lock();
        for campaign in campaigns {
            by_campaign.remove(campaign);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_campaign.lock().is_empty()
    }
}
