//! Keeps the virtual devices on each card in line with the topology
//! ConfigMap.
//!
//! A periodic task and a ConfigMap watch both end up in
//! [`VirtualDeviceReconciler::sync`], which holds one mutex for the whole
//! pass so two passes never overlap. Within a pass, destroys run first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::chip::ChipManager;
use crate::domain::device::DeviceId;
use crate::domain::errors::ConfigError;
use crate::domain::topology::annotated_for_phy;
use crate::domain::topology::parse_topology;
use crate::domain::topology::plan_create;
use crate::domain::topology::plan_destroy;
use crate::domain::topology::CardVnpus;
use crate::infrastructure::driver::DriverError;
use crate::infrastructure::driver::NpuDriver;
use crate::infrastructure::k8s::ClusterClient;
use crate::plugin::registry::DeviceRegistry;

/// Extra attempts after the first failed create or destroy call.
pub const VDEV_RETRIES: usize = 2;
pub const CARD_INTERVAL: Duration = Duration::from_secs(1);
/// Pause before reopening a topology watch that ended.
pub const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Where the desired topology lives.
#[derive(Debug, Clone)]
pub struct TopologySource {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub destroyed: Vec<DeviceId>,
    pub created: Vec<u32>,
    pub failed: usize,
}

pub struct VirtualDeviceReconciler {
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<DeviceRegistry>,
    node_name: String,
    source: TopologySource,
    card_interval: Duration,
    watch_restart_delay: Duration,
    /// Cards applied by the last pass; the watch only acts on a difference.
    last_cards: Mutex<Option<Vec<CardVnpus>>>,
}

impl VirtualDeviceReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<DeviceRegistry>,
        node_name: String,
        source: TopologySource,
    ) -> Self {
        Self {
            cluster,
            registry,
            node_name,
            source,
            card_interval: CARD_INTERVAL,
            watch_restart_delay: WATCH_RESTART_DELAY,
            last_cards: Mutex::new(None),
        }
    }

    pub fn with_card_interval(mut self, interval: Duration) -> Self {
        self.card_interval = interval;
        self
    }

    pub fn with_watch_restart_delay(mut self, delay: Duration) -> Self {
        self.watch_restart_delay = delay;
        self
    }

    fn manager(&self) -> &Arc<ChipManager> {
        self.registry.manager()
    }

    fn cards_from(&self, config_map: &ConfigMap) -> Result<Vec<CardVnpus>, Report<ConfigError>> {
        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(&self.source.key))
            .ok_or_else(|| {
                Report::new(ConfigError::MalformedTopology {
                    message: format!(
                        "key {} missing from {}/{}",
                        self.source.key, self.source.namespace, self.source.name
                    ),
                })
            })?;
        parse_topology(raw, &self.node_name)
    }

    async fn fetch_cards(&self) -> Result<Vec<CardVnpus>, Report<ConfigError>> {
        let config_map = self
            .cluster
            .get_config_map(&self.source.namespace, &self.source.name)
            .await
            .change_context(ConfigError::MalformedTopology {
                message: "failed to read topology ConfigMap".to_string(),
            })?
            .ok_or_else(|| {
                Report::new(ConfigError::MalformedTopology {
                    message: format!(
                        "ConfigMap {}/{} not found",
                        self.source.namespace, self.source.name
                    ),
                })
            })?;
        self.cards_from(&config_map)
    }

    /// Fetch the topology and apply it. A rejected topology leaves the
    /// hardware untouched.
    pub async fn sync(&self) -> Result<SyncOutcome, Report<ConfigError>> {
        let cards = self.fetch_cards().await?;
        Ok(self.apply(cards).await)
    }

    /// Bring the cards in line with `cards`, then rediscover devices.
    #[tracing::instrument(skip_all, fields(node = %self.node_name))]
    pub async fn apply(&self, cards: Vec<CardVnpus>) -> SyncOutcome {
        let mut last_cards = self.last_cards.lock().await;
        let mut outcome = SyncOutcome::default();

        let inventory = match self.manager().discover() {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("device discovery failed, skipping virtual device sync: {e:?}");
                return outcome;
            }
        };
        let annotations = match self.cluster.get_node(&self.node_name).await {
            Ok(node) => node.metadata.annotations.unwrap_or_default(),
            Err(e) => {
                warn!("failed to read node annotations, skipping virtual device sync: {e:?}");
                return outcome;
            }
        };

        let family = self.manager().family();
        let annotated: BTreeMap<u32, Vec<DeviceId>> = inventory
            .phy_ids
            .iter()
            .map(|phy_id| (*phy_id, annotated_for_phy(&annotations, family, *phy_id)))
            .collect();

        for id in plan_destroy(&cards, &inventory.phy_to_vdevs, &annotated) {
            let Some(vdev_id) = id.vdev_id() else {
                continue;
            };
            match self.with_retry("destroy", id.phy_id(), |driver, logic_id| {
                driver.destroy_virtual_device(logic_id, vdev_id)
            }) {
                Ok(()) => {
                    info!(device = %id, "destroyed virtual device");
                    outcome.destroyed.push(id);
                }
                Err(e) => {
                    error!(device = %id, "failed to destroy virtual device: {e:?}");
                    outcome.failed += 1;
                }
            }
        }

        for card in &cards {
            let Some(phy_id) = card.phy_id() else {
                warn!(card = %card.card_name, "skipping card with invalid name");
                continue;
            };
            if !inventory.phy_ids.contains(&phy_id) {
                debug!(card = %card.card_name, "card not present on this node");
                continue;
            }
            let claimed = annotated.get(&phy_id).map(Vec::as_slice).unwrap_or_default();
            // every present card is paced, even with nothing to create
            for class in plan_create(card, claimed) {
                let Some(template) = family.template_for_class(&class) else {
                    warn!(card = %card.card_name, class = %class, "no template for core class");
                    outcome.failed += 1;
                    continue;
                };
                match self.with_retry("create", phy_id, |driver, logic_id| {
                    driver.create_virtual_device(logic_id, template)
                }) {
                    Ok(vdev_id) => {
                        info!(card = %card.card_name, vdev_id, template, "created virtual device");
                        outcome.created.push(vdev_id);
                    }
                    Err(e) => {
                        error!(
                            card = %card.card_name,
                            template,
                            "failed to create virtual device: {e:?}"
                        );
                        outcome.failed += 1;
                    }
                }
            }
            tokio::time::sleep(self.card_interval).await;
        }

        if let Err(e) = self.registry.refresh() {
            warn!("device refresh after virtual device sync failed: {e:?}");
        }
        *last_cards = Some(cards);
        outcome
    }

    /// Call `op` with a freshly resolved logic ID, up to `VDEV_RETRIES`
    /// extra times.
    fn with_retry<T>(
        &self,
        operation: &str,
        phy_id: u32,
        op: impl Fn(&dyn NpuDriver, u32) -> Result<T, Report<DriverError>>,
    ) -> Result<T, Report<DriverError>> {
        let driver = &**self.manager().driver();
        let mut attempt = 0;
        loop {
            let result = driver
                .get_logic_id(phy_id)
                .and_then(|logic_id| op(driver, logic_id));
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < VDEV_RETRIES => {
                    attempt += 1;
                    warn!(phy_id, attempt, "virtual device {operation} failed, retrying: {e:?}");
                }
                Err(e) => {
                    return Err(e.attach_printable(format!(
                        "{operation} on phy id {phy_id} failed after {} attempts",
                        VDEV_RETRIES + 1
                    )))
                }
            }
        }
    }

    /// Periodic full sync until cancelled.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("virtual device sync stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("virtual device topology rejected, keeping current state: {e:?}");
                    }
                }
            }
        }
    }

    /// React to topology edits. Only a change in this node's cards triggers
    /// a pass. A watch stream that ends is reopened after
    /// `WATCH_RESTART_DELAY`.
    pub async fn run_watch(self: Arc<Self>, token: CancellationToken) {
        loop {
            let mut events = self
                .cluster
                .watch_config_map(&self.source.namespace, &self.source.name);
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => {
                        info!("topology watch stopped");
                        return;
                    }
                    event = events.next() => event,
                };
                let Some(event) = event else {
                    warn!(
                        delay = ?self.watch_restart_delay,
                        "topology watch stream ended, restarting"
                    );
                    break;
                };
                let config_map = match event {
                    Ok(config_map) => config_map,
                    Err(e) => {
                        warn!("topology watch error: {e:?}");
                        continue;
                    }
                };
                let cards = match self.cards_from(&config_map) {
                    Ok(cards) => cards,
                    Err(e) => {
                        warn!("topology update rejected: {e:?}");
                        continue;
                    }
                };
                if self.last_cards.lock().await.as_ref() == Some(&cards) {
                    debug!("topology unchanged for this node");
                    continue;
                }
                info!("topology changed, syncing virtual devices");
                self.apply(cards).await;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("topology watch stopped");
                    return;
                }
                _ = tokio::time::sleep(self.watch_restart_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::driver::inventory::tests::TWO_CARD_910;
    use crate::infrastructure::driver::InventoryDriver;
    use crate::infrastructure::k8s::mock::MockClusterClient;

    const KEY: &str = "VNPUCfg";

    fn topology(cards: serde_json::Value) -> ConfigMap {
        let document = json!({
            "Nodes": [{"NodeName": "worker-1", "Cards": cards}],
            "UpdateTime": 1,
            "CheckCode": 7,
        });
        ConfigMap {
            data: Some(BTreeMap::from([(KEY.to_string(), document.to_string())])),
            ..Default::default()
        }
    }

    struct Fixture {
        driver: Arc<InventoryDriver>,
        mock: MockClusterClient,
        reconciler: Arc<VirtualDeviceReconciler>,
    }

    fn fixture(config_map: Option<ConfigMap>) -> Fixture {
        let driver = Arc::new(InventoryDriver::from_yaml(TWO_CARD_910).expect("should load"));
        let manager = Arc::new(ChipManager::detect(driver.clone()).expect("should detect"));
        let (registry, _rx) = DeviceRegistry::discover(manager).expect("should discover");
        let mock = MockClusterClient::new("worker-1");
        mock.state.lock().expect("poisoned").config_map = config_map;
        let reconciler = VirtualDeviceReconciler::new(
            Arc::new(mock.clone()),
            Arc::new(registry),
            "worker-1".to_string(),
            TopologySource {
                namespace: "volcano-system".to_string(),
                name: "mindx-dl-vnpu-manager".to_string(),
                key: KEY.to_string(),
            },
        )
        .with_card_interval(Duration::ZERO)
        .with_watch_restart_delay(Duration::from_millis(10));
        Fixture {
            driver,
            mock,
            reconciler: Arc::new(reconciler),
        }
    }

    fn vdev_ids(driver: &InventoryDriver, phy_id: u32) -> Vec<u32> {
        let logic = driver.get_logic_id(phy_id).expect("should resolve");
        driver
            .get_vdevices_info(logic)
            .expect("should query")
            .vdevs
            .iter()
            .map(|v| v.vdev_id)
            .collect()
    }

    #[tokio::test]
    async fn creates_exactly_the_deficit() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-0", "Req": ["Ascend910-4c", "Ascend910-4c", "Ascend910-8c"], "Alloc": []}
        ]))));

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(outcome.created.len(), 3, "should create two 4c and one 8c");
        assert_eq!(outcome.failed, 0);
        assert_eq!(vdev_ids(&f.driver, 0).len(), 3);

        let registry_types = f.reconciler.registry.device_types();
        assert!(registry_types.contains("Ascend910-4c"));
    }

    #[tokio::test]
    async fn satisfied_card_creates_nothing() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-1", "Req": ["Ascend910-8c", "Ascend910-4c"],
             "Alloc": ["huawei.com/Ascend910-8c-100-1", "huawei.com/Ascend910-4c-101-1"]}
        ]))));

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(outcome, SyncOutcome::default(), "should leave the card alone");
        assert_eq!(f.driver.call_count("create_virtual_device"), 0);
    }

    #[tokio::test]
    async fn claimed_devices_are_never_destroyed() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-1", "Req": [],
             "Alloc": ["Ascend910-8c-100-1", "Ascend910-4c-101-1"]}
        ]))));

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert!(outcome.destroyed.is_empty(), "should keep claimed devices");
        assert_eq!(vdev_ids(&f.driver, 1), vec![100, 101]);
    }

    #[tokio::test]
    async fn destroy_runs_before_create() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-1", "Req": ["Ascend910-16c", "Ascend910-16c"], "Alloc": []}
        ]))));

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(
            outcome.destroyed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["Ascend910-4c-101-1".to_string(), "Ascend910-8c-100-1".to_string()]
        );
        assert_eq!(outcome.created.len(), 2, "should fit both 16c once freed");
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn published_devices_are_protected() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-1", "Req": [], "Alloc": []}
        ]))));
        f.mock.set_node(|node| {
            node.metadata.annotations = Some(BTreeMap::from([(
                "huawei.com/Ascend910-8c".to_string(),
                "Ascend910-8c-100-1".to_string(),
            )]));
        });

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(
            outcome.destroyed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["Ascend910-4c-101-1".to_string()]
        );
        assert_eq!(vdev_ids(&f.driver, 1), vec![100]);
    }

    #[tokio::test]
    async fn create_succeeds_within_retry_budget() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-0", "Req": ["Ascend910-2c"], "Alloc": []}
        ]))));
        f.driver
            .fail_next("create_virtual_device", 2)
            .expect("should arm failure");

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(outcome.created.len(), 1, "should succeed on the third attempt");
        assert_eq!(f.driver.call_count("create_virtual_device"), 3);
    }

    #[tokio::test]
    async fn create_gives_up_after_retry_budget() {
        let f = fixture(Some(topology(json!([
            {"CardName": "Ascend910-0", "Req": ["Ascend910-2c"], "Alloc": []}
        ]))));
        f.driver
            .fail_next("create_virtual_device", 5)
            .expect("should arm failure");

        let outcome = f.reconciler.sync().await.expect("should sync");
        assert_eq!(outcome.created.len(), 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(f.driver.call_count("create_virtual_device"), 3);
    }

    #[tokio::test]
    async fn rejected_topology_leaves_hardware_untouched() {
        let mut config_map = topology(json!([]));
        config_map.data = Some(BTreeMap::from([(
            KEY.to_string(),
            json!({"Nodes": [], "UpdateTime": 1, "CheckCode": 0}).to_string(),
        )]));
        let f = fixture(Some(config_map));

        let result = f.reconciler.sync().await;
        assert!(result.is_err(), "should reject a zero check code");
        assert_eq!(f.driver.call_count("destroy_virtual_device"), 0);
        assert_eq!(vdev_ids(&f.driver, 1), vec![100, 101]);
    }

    async fn wait_for_creates(driver: &InventoryDriver, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while driver.call_count("create_virtual_device") < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("should reach the expected create count");
    }

    #[test_log::test(tokio::test)]
    async fn watch_only_acts_on_changed_cards() {
        let f = fixture(None);
        let events = f.mock.config_map_events();
        let token = CancellationToken::new();
        let watch = tokio::spawn(f.reconciler.clone().run_watch(token.clone()));

        let cards = json!([{"CardName": "Ascend910-0", "Req": ["Ascend910-2c"], "Alloc": []}]);
        for _ in 0..2 {
            events.send(topology(cards.clone())).expect("should send");
        }
        wait_for_creates(&f.driver, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            f.driver.call_count("create_virtual_device"),
            1,
            "should ignore an identical second update"
        );
        token.cancel();
        watch.await.expect("watch task should finish");
    }

    #[test_log::test(tokio::test)]
    async fn watch_resumes_after_stream_ends() {
        let f = fixture(None);
        let first = f.mock.config_map_events();
        let token = CancellationToken::new();
        let watch = tokio::spawn(f.reconciler.clone().run_watch(token.clone()));

        first
            .send(topology(json!([
                {"CardName": "Ascend910-0", "Req": ["Ascend910-2c"], "Alloc": []}
            ])))
            .expect("should send");
        wait_for_creates(&f.driver, 1).await;

        let second = f.mock.config_map_events();
        drop(first);
        second
            .send(topology(json!([
                {"CardName": "Ascend910-0", "Req": ["Ascend910-4c"], "Alloc": []}
            ])))
            .expect("should send");
        wait_for_creates(&f.driver, 2).await;

        assert!(!watch.is_finished(), "should keep watching");
        token.cancel();
        watch.await.expect("watch task should finish");
    }

    #[tokio::test]
    async fn every_present_card_is_paced() {
        let f = fixture(None);
        let reconciler = VirtualDeviceReconciler::new(
            f.reconciler.cluster.clone(),
            f.reconciler.registry.clone(),
            "worker-1".to_string(),
            f.reconciler.source.clone(),
        )
        .with_card_interval(Duration::from_millis(50));
        let cards = vec![
            serde_json::from_value::<CardVnpus>(
                json!({"CardName": "Ascend910-0", "Req": [], "Alloc": []}),
            )
            .expect("should parse card"),
            serde_json::from_value::<CardVnpus>(json!({
                "CardName": "Ascend910-1",
                "Req": ["Ascend910-8c", "Ascend910-4c"],
                "Alloc": ["Ascend910-8c-100-1", "Ascend910-4c-101-1"]
            }))
            .expect("should parse card"),
        ];

        let started = std::time::Instant::now();
        let outcome = reconciler.apply(cards).await;
        assert_eq!(outcome, SyncOutcome::default(), "should have nothing to do");
        assert!(
            started.elapsed() >= Duration::from_millis(100),
            "should wait after each card even when nothing was created"
        );
    }
}
