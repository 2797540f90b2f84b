//! App-session runtime: one cache, one socket, one sync hook per resource.

use log::info;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::catalog;
use crate::client::QueryClient;
use crate::config::SyncConfig;
use crate::resource::{ResourceSync, SyncBinding};
use stockyard_api::ApiClient;
use stockyard_core::entities::{
    CalendarEvent, ChamberStock, Contractor, DispatchOrder, Package, Production, RawMaterialOrder,
    Truck, User, Vendor,
};
use stockyard_core::QueryCache;
use stockyard_realtime::SocketChannel;

pub struct SyncContext {
    pub config: Arc<SyncConfig>,
    pub api: Arc<ApiClient>,
    pub client: QueryClient,
    pub channel: SocketChannel,

    // Resources
    pub raw_material_orders: ResourceSync<RawMaterialOrder>,
    pub chamber_stock: ResourceSync<ChamberStock>,
    pub production: ResourceSync<Production>,
    pub trucks: ResourceSync<Truck>,
    pub vendors: ResourceSync<Vendor>,
    pub packages: ResourceSync<Package>,
    pub dispatch_orders: ResourceSync<DispatchOrder>,
    pub users: ResourceSync<User>,
    pub contractors: ResourceSync<Contractor>,
    pub calendar_events: ResourceSync<CalendarEvent>,

    bindings: Mutex<Vec<SyncBinding>>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("api_url", &self.config.api_url)
            .field("channel", &self.channel)
            .field("client", &self.client)
            .finish()
    }
}

impl SyncContext {
    pub fn new(config: SyncConfig) -> Self {
        let mut api = ApiClient::new(&config.api_url);
        if let Some(token) = &config.access_token {
            api = api.with_access_token(token.clone());
        }
        Self::with_api(config, Arc::new(api))
    }

    /// Build the context around an existing API client.
    pub fn with_api(config: SyncConfig, api: Arc<ApiClient>) -> Self {
        let client = QueryClient::new(Arc::new(QueryCache::new()), config.stale_time);
        let page_size = config.page_size;

        Self {
            raw_material_orders: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::raw_material_orders(),
                page_size,
            ),
            chamber_stock: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::chamber_stock(),
                page_size,
            ),
            production: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::production(),
                page_size,
            ),
            trucks: ResourceSync::new(client.clone(), api.clone(), catalog::trucks(), page_size),
            vendors: ResourceSync::new(client.clone(), api.clone(), catalog::vendors(), page_size),
            packages: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::packages(),
                page_size,
            ),
            dispatch_orders: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::dispatch_orders(),
                page_size,
            ),
            users: ResourceSync::new(client.clone(), api.clone(), catalog::users(), page_size),
            contractors: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::contractors(),
                page_size,
            ),
            calendar_events: ResourceSync::new(
                client.clone(),
                api.clone(),
                catalog::calendar_events(),
                page_size,
            ),
            config: Arc::new(config),
            api,
            client,
            channel: SocketChannel::new(),
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Bind every resource to the socket and connect. Calling it again while
    /// running is a no-op.
    pub async fn start(&self) {
        {
            let mut bindings = self.bindings.lock().await;
            if bindings.is_empty() {
                *bindings = self.bind_all();
                info!("[Sync] Bound {} resources", bindings.len());
            }
        }
        self.channel.connect(self.config.socket_config()).await;
    }

    /// Unbind every resource and disconnect the socket.
    pub async fn stop(&self) {
        self.bindings.lock().await.clear();
        self.channel.disconnect().await;
        info!("[Sync] Stopped");
    }

    /// App-wide cache clear, e.g. on logout.
    pub fn clear_cache(&self) {
        self.client.clear();
        info!("[Sync] Cache cleared");
    }

    pub async fn is_bound(&self) -> bool {
        !self.bindings.lock().await.is_empty()
    }

    fn bind_all(&self) -> Vec<SyncBinding> {
        let channel = &self.channel;
        vec![
            self.raw_material_orders.bind(channel),
            self.chamber_stock.bind(channel),
            self.production.bind(channel),
            self.trucks.bind(channel),
            self.vendors.bind(channel),
            self.packages.bind(channel),
            self.dispatch_orders.bind(channel),
            self.users.bind(channel),
            self.contractors.bind(channel),
            self.calendar_events.bind(channel),
        ]
    }
}
