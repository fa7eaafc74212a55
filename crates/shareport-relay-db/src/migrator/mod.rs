//! Database migrations

use sea_orm_migration::prelude::*;

mod m20261001_000001_init_schema;
mod m20261015_000001_add_tunnel_write_key;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_init_schema::Migration),
            Box::new(m20261015_000001_add_tunnel_write_key::Migration),
        ]
    }
}
