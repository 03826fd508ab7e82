use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Delivery, Item, Order, Payment};
use futures_util::TryStreamExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Row};

use crate::{
    OrderUid, Result, SaveStage, StoreError,
    store::{OrderStore, Persisted},
};

const ROOT_COLUMNS: &str = "order_uid, track_number, entry, locale, internal_signature, \
     customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard";

/// PostgreSQL-backed order store implementation.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool and verifies the database is reachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!(max_connections, "connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Closes every pooled connection, waiting for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn stage_error(
        order_uid: &OrderUid,
        stage: SaveStage,
    ) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
        move |source| StoreError::Save {
            order_uid: order_uid.clone(),
            stage,
            source,
        }
    }

    fn row_to_root(row: &PgRow) -> std::result::Result<Order, sqlx::Error> {
        Ok(Order {
            order_uid: OrderUid::from(row.try_get::<String, _>("order_uid")?),
            track_number: row.try_get("track_number")?,
            entry: row.try_get("entry")?,
            locale: row.try_get("locale")?,
            internal_signature: row.try_get("internal_signature")?,
            customer_id: row.try_get("customer_id")?,
            delivery_service: row.try_get("delivery_service")?,
            shardkey: row.try_get("shardkey")?,
            sm_id: row.try_get("sm_id")?,
            date_created: row.try_get::<DateTime<Utc>, _>("date_created")?,
            oof_shard: row.try_get("oof_shard")?,
            ..Order::default()
        })
    }

    fn row_to_delivery(row: &PgRow) -> std::result::Result<Delivery, sqlx::Error> {
        Ok(Delivery {
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
            zip: row.try_get("zip")?,
            city: row.try_get("city")?,
            address: row.try_get("address")?,
            region: row.try_get("region")?,
            email: row.try_get("email")?,
        })
    }

    fn row_to_payment(row: &PgRow) -> std::result::Result<Payment, sqlx::Error> {
        Ok(Payment {
            transaction: row.try_get("transaction")?,
            request_id: row.try_get("request_id")?,
            currency: row.try_get("currency")?,
            provider: row.try_get("provider")?,
            amount: row.try_get("amount")?,
            payment_dt: row.try_get("payment_dt")?,
            bank: row.try_get("bank")?,
            delivery_cost: row.try_get("delivery_cost")?,
            goods_total: row.try_get("goods_total")?,
            custom_fee: row.try_get("custom_fee")?,
        })
    }

    fn row_to_item(row: &PgRow) -> std::result::Result<Item, sqlx::Error> {
        Ok(Item {
            chrt_id: row.try_get("chrt_id")?,
            track_number: row.try_get("track_number")?,
            price: row.try_get("price")?,
            rid: row.try_get("rid")?,
            name: row.try_get("name")?,
            sale: row.try_get("sale")?,
            size: row.try_get("size")?,
            total_price: row.try_get("total_price")?,
            nm_id: row.try_get("nm_id")?,
            brand: row.try_get("brand")?,
            status: row.try_get("status")?,
        })
    }

    async fn save_in_transaction(&self, order: &Order) -> Result<Persisted> {
        let uid = order.uid();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(Self::stage_error(uid, SaveStage::Begin))?;

        let created = Self::insert_root(&mut *tx, order)
            .await
            .map_err(Self::stage_error(uid, SaveStage::Root))?;

        let stored = if created {
            order.clone()
        } else {
            let sql = format!("SELECT {ROOT_COLUMNS} FROM orders WHERE order_uid = $1");
            let row = sqlx::query(&sql)
                .bind(uid.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(Self::stage_error(uid, SaveStage::Root))?;
            let root = Self::row_to_root(&row).map_err(Self::stage_error(uid, SaveStage::Root))?;
            order.clone().with_root_of(&root)
        };

        Self::upsert_delivery(&mut *tx, uid, &order.delivery)
            .await
            .map_err(Self::stage_error(uid, SaveStage::Delivery))?;

        Self::upsert_payment(&mut *tx, uid, &order.payment)
            .await
            .map_err(Self::stage_error(uid, SaveStage::Payment))?;

        Self::replace_items(&mut *tx, uid, &order.items)
            .await
            .map_err(Self::stage_error(uid, SaveStage::Item))?;

        tx.commit()
            .await
            .map_err(Self::stage_error(uid, SaveStage::Commit))?;

        Ok(Persisted {
            order: stored,
            created,
        })
    }

    /// Inserts the root row unless it already exists. Returns true if inserted.
    async fn insert_root(
        conn: &mut PgConnection,
        order: &Order,
    ) -> std::result::Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (order_uid, track_number, entry, locale, internal_signature,
                                customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (order_uid) DO NOTHING
            "#,
        )
        .bind(order.order_uid.as_str())
        .bind(&order.track_number)
        .bind(&order.entry)
        .bind(&order.locale)
        .bind(&order.internal_signature)
        .bind(&order.customer_id)
        .bind(&order.delivery_service)
        .bind(&order.shardkey)
        .bind(order.sm_id)
        .bind(order.date_created)
        .bind(&order.oof_shard)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_delivery(
        conn: &mut PgConnection,
        uid: &OrderUid,
        delivery: &Delivery,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (order_uid, name, phone, zip, city, address, region, email)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_uid) DO UPDATE SET
                name = EXCLUDED.name,
                phone = EXCLUDED.phone,
                zip = EXCLUDED.zip,
                city = EXCLUDED.city,
                address = EXCLUDED.address,
                region = EXCLUDED.region,
                email = EXCLUDED.email
            "#,
        )
        .bind(uid.as_str())
        .bind(&delivery.name)
        .bind(&delivery.phone)
        .bind(&delivery.zip)
        .bind(&delivery.city)
        .bind(&delivery.address)
        .bind(&delivery.region)
        .bind(&delivery.email)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn upsert_payment(
        conn: &mut PgConnection,
        uid: &OrderUid,
        payment: &Payment,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO payments (order_uid, transaction, request_id, currency, provider,
                                  amount, payment_dt, bank, delivery_cost, goods_total, custom_fee)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (order_uid) DO UPDATE SET
                transaction = EXCLUDED.transaction,
                request_id = EXCLUDED.request_id,
                currency = EXCLUDED.currency,
                provider = EXCLUDED.provider,
                amount = EXCLUDED.amount,
                payment_dt = EXCLUDED.payment_dt,
                bank = EXCLUDED.bank,
                delivery_cost = EXCLUDED.delivery_cost,
                goods_total = EXCLUDED.goods_total,
                custom_fee = EXCLUDED.custom_fee
            "#,
        )
        .bind(uid.as_str())
        .bind(&payment.transaction)
        .bind(&payment.request_id)
        .bind(&payment.currency)
        .bind(&payment.provider)
        .bind(payment.amount)
        .bind(payment.payment_dt)
        .bind(&payment.bank)
        .bind(payment.delivery_cost)
        .bind(payment.goods_total)
        .bind(payment.custom_fee)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Deletes the order's item rows and inserts `items` in received order.
    async fn replace_items(
        conn: &mut PgConnection,
        uid: &OrderUid,
        items: &[Item],
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM items WHERE order_uid = $1")
            .bind(uid.as_str())
            .execute(&mut *conn)
            .await?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO items (order_uid, position, chrt_id, track_number, price, rid, name,
                                   sale, size, total_price, nm_id, brand, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(uid.as_str())
            .bind(position as i32)
            .bind(item.chrt_id)
            .bind(&item.track_number)
            .bind(item.price)
            .bind(&item.rid)
            .bind(&item.name)
            .bind(item.sale)
            .bind(&item.size)
            .bind(item.total_price)
            .bind(item.nm_id)
            .bind(&item.brand)
            .bind(item.status)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn attach_deliveries(
        conn: &mut PgConnection,
        orders: &mut [Order],
        index: &HashMap<String, usize>,
    ) {
        let rows = Self::fetch_isolated(
            conn,
            "SELECT order_uid, name, phone, zip, city, address, region, email FROM deliveries",
        )
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load deliveries, leaving them empty");
                return;
            }
        };

        for row in rows {
            let Some(slot) = Self::slot_for(&row, index) else {
                continue;
            };
            match Self::row_to_delivery(&row) {
                Ok(delivery) => orders[slot].delivery = delivery,
                Err(e) => tracing::warn!(
                    order_uid = %orders[slot].order_uid,
                    error = %e,
                    "failed to read delivery row"
                ),
            }
        }
    }

    async fn attach_payments(
        conn: &mut PgConnection,
        orders: &mut [Order],
        index: &HashMap<String, usize>,
    ) {
        let rows = Self::fetch_isolated(
            conn,
            r#"
            SELECT order_uid, transaction, request_id, currency, provider, amount,
                   payment_dt, bank, delivery_cost, goods_total, custom_fee
            FROM payments
            "#,
        )
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load payments, leaving them empty");
                return;
            }
        };

        for row in rows {
            let Some(slot) = Self::slot_for(&row, index) else {
                continue;
            };
            match Self::row_to_payment(&row) {
                Ok(payment) => orders[slot].payment = payment,
                Err(e) => tracing::warn!(
                    order_uid = %orders[slot].order_uid,
                    error = %e,
                    "failed to read payment row"
                ),
            }
        }
    }

    async fn attach_items(
        conn: &mut PgConnection,
        orders: &mut [Order],
        index: &HashMap<String, usize>,
    ) {
        let rows = Self::fetch_isolated(
            conn,
            r#"
            SELECT order_uid, chrt_id, track_number, price, rid, name, sale,
                   size, total_price, nm_id, brand, status
            FROM items
            ORDER BY order_uid, position
            "#,
        )
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load items, leaving them empty");
                return;
            }
        };

        for row in rows {
            let Some(slot) = Self::slot_for(&row, index) else {
                continue;
            };
            match Self::row_to_item(&row) {
                Ok(item) => orders[slot].items.push(item),
                Err(e) => tracing::warn!(
                    order_uid = %orders[slot].order_uid,
                    error = %e,
                    "skipping unreadable item row"
                ),
            }
        }
    }

    /// Runs `sql` under a savepoint so a failing query leaves the enclosing
    /// transaction usable for the queries after it.
    async fn fetch_isolated(
        conn: &mut PgConnection,
        sql: &str,
    ) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
        let mut savepoint = conn.begin().await?;
        match sqlx::query(sql).fetch_all(&mut *savepoint).await {
            Ok(rows) => {
                savepoint.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = savepoint.rollback().await {
                    tracing::warn!(error = %rollback, "failed to roll back to savepoint");
                }
                Err(e)
            }
        }
    }

    fn slot_for(row: &PgRow, index: &HashMap<String, usize>) -> Option<usize> {
        let uid: String = row.try_get("order_uid").ok()?;
        index.get(&uid).copied()
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[tracing::instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn save(&self, order: &Order) -> Result<Persisted> {
        let started = Instant::now();
        let result = self.save_in_transaction(order).await;

        metrics::histogram!("order_store_save_seconds").record(started.elapsed().as_secs_f64());
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("order_store_saves_total", "result" => label).increment(1);

        result
    }

    #[tracing::instrument(skip(self))]
    async fn load_all(&self) -> Result<Vec<Order>> {
        // One snapshot for all four queries so sub-records match their roots.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut orders = Vec::new();
        let mut index = HashMap::new();
        let sql = format!("SELECT {ROOT_COLUMNS} FROM orders ORDER BY date_created, order_uid");
        {
            let mut roots = sqlx::query(&sql).fetch(&mut *tx);

            while let Some(row) = roots.try_next().await? {
                match Self::row_to_root(&row) {
                    Ok(order) => {
                        index.insert(order.order_uid.as_str().to_string(), orders.len());
                        orders.push(order);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable order row"),
                }
            }
        }

        Self::attach_deliveries(&mut *tx, &mut orders, &index).await;
        Self::attach_payments(&mut *tx, &mut orders, &index).await;
        Self::attach_items(&mut *tx, &mut orders, &index).await;

        // Read-only; a failed commit loses nothing already read.
        if let Err(e) = tx.commit().await {
            tracing::warn!(error = %e, "failed to close load transaction");
        }

        tracing::info!(orders = orders.len(), "loaded orders from store");
        Ok(orders)
    }
}
