//! Ledger schema.
//!
//! Creates the event tables (transfers and checkouts), the balance cache,
//! and the fine, write-off and inactivity cost records.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        // ============================================================
        // PART 1: ACCOUNTS
        // ============================================================
        db.execute_unprepared(USERS_SQL).await?;

        // ============================================================
        // PART 2: LEDGER EVENTS
        // ============================================================
        db.execute_unprepared(TRANSFERS_SQL).await?;
        db.execute_unprepared(CHECKOUTS_SQL).await?;

        // ============================================================
        // PART 3: BALANCE CACHE
        // ============================================================
        db.execute_unprepared(BALANCES_SQL).await?;

        // ============================================================
        // PART 4: FINES, WRITE-OFFS, INACTIVITY
        // ============================================================
        db.execute_unprepared(FINES_SQL).await?;
        db.execute_unprepared(WRITE_OFFS_SQL).await?;

        // ============================================================
        // PART 5: TRIGGERS
        // ============================================================
        db.execute_unprepared(TRIGGERS_SQL).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(DROP_SQL).await?;
        Ok(())
    }
}

const USERS_SQL: &str = r"
CREATE TABLE users (
    id BIGSERIAL PRIMARY KEY,
    active BOOLEAN NOT NULL DEFAULT true,
    inactive_notified BOOLEAN NOT NULL DEFAULT false,
    current_fines_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Inactivity scan
CREATE INDEX idx_users_inactivity ON users(id) WHERE active AND NOT inactive_notified;
";

const TRANSFERS_SQL: &str = r"
-- Append-only: corrections are offsetting transfers
CREATE TABLE transfers (
    id BIGSERIAL PRIMARY KEY,
    from_user_id BIGINT REFERENCES users(id),
    to_user_id BIGINT REFERENCES users(id),
    amount BIGINT NOT NULL,
    currency VARCHAR(3) NOT NULL,
    precision SMALLINT NOT NULL,
    description TEXT,
    cause_kind VARCHAR(32) NOT NULL,
    cause_ref BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_transfer_amount_positive CHECK (amount > 0),
    CONSTRAINT chk_transfer_has_party CHECK (from_user_id IS NOT NULL OR to_user_id IS NOT NULL),
    CONSTRAINT chk_transfer_not_self CHECK (from_user_id IS DISTINCT FROM to_user_id)
);

CREATE INDEX idx_transfers_from ON transfers(from_user_id, id);
CREATE INDEX idx_transfers_to ON transfers(to_user_id, id);
CREATE INDEX idx_transfers_cause ON transfers(cause_kind, cause_ref);
";

const CHECKOUTS_SQL: &str = r"
CREATE TABLE transactions (
    id BIGSERIAL PRIMARY KEY,
    from_user_id BIGINT NOT NULL REFERENCES users(id),
    created_by_id BIGINT NOT NULL REFERENCES users(id),
    point_of_sale_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX idx_transactions_from ON transactions(from_user_id, id);

CREATE TABLE sub_transactions (
    id BIGSERIAL PRIMARY KEY,
    transaction_id BIGINT NOT NULL REFERENCES transactions(id),
    to_user_id BIGINT NOT NULL REFERENCES users(id),
    container_id BIGINT NOT NULL
);

CREATE INDEX idx_sub_transactions_transaction ON sub_transactions(transaction_id);
CREATE INDEX idx_sub_transactions_to ON sub_transactions(to_user_id, transaction_id);

CREATE TABLE sub_transaction_rows (
    id BIGSERIAL PRIMARY KEY,
    sub_transaction_id BIGINT NOT NULL REFERENCES sub_transactions(id),
    product_id BIGINT NOT NULL,
    product_revision INTEGER NOT NULL,
    quantity BIGINT NOT NULL,
    price_amount BIGINT NOT NULL,
    price_currency VARCHAR(3) NOT NULL,
    price_precision SMALLINT NOT NULL,
    CONSTRAINT chk_row_quantity_positive CHECK (quantity > 0),
    CONSTRAINT chk_row_price_not_negative CHECK (price_amount >= 0)
);

CREATE INDEX idx_sub_transaction_rows_sub ON sub_transaction_rows(sub_transaction_id);
";

const BALANCES_SQL: &str = r"
CREATE TABLE balances (
    user_id BIGINT PRIMARY KEY REFERENCES users(id),
    amount BIGINT NOT NULL,
    currency VARCHAR(3) NOT NULL,
    precision SMALLINT NOT NULL,
    last_transfer_id BIGINT REFERENCES transfers(id),
    last_transfer_date TIMESTAMPTZ,
    last_transaction_id BIGINT REFERENCES transactions(id),
    last_transaction_date TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

const FINES_SQL: &str = r"
CREATE TABLE user_fine_groups (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    waived BOOLEAN NOT NULL DEFAULT false,
    waived_transfer_id BIGINT REFERENCES transfers(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_waived_has_transfer CHECK (NOT waived OR waived_transfer_id IS NOT NULL)
);

CREATE INDEX idx_user_fine_groups_user ON user_fine_groups(user_id);

ALTER TABLE users
    ADD CONSTRAINT fk_users_current_fines
    FOREIGN KEY (current_fines_id) REFERENCES user_fine_groups(id);

CREATE TABLE fines (
    id BIGSERIAL PRIMARY KEY,
    user_fine_group_id BIGINT NOT NULL REFERENCES user_fine_groups(id),
    user_id BIGINT NOT NULL REFERENCES users(id),
    transfer_id BIGINT NOT NULL UNIQUE REFERENCES transfers(id),
    amount BIGINT NOT NULL,
    reference_balance BIGINT NOT NULL,
    currency VARCHAR(3) NOT NULL,
    precision SMALLINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_fine_amount_positive CHECK (amount > 0)
);

CREATE INDEX idx_fines_group ON fines(user_fine_group_id, id);
";

const WRITE_OFFS_SQL: &str = r"
CREATE TABLE write_offs (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    transfer_id BIGINT NOT NULL UNIQUE REFERENCES transfers(id),
    amount BIGINT NOT NULL,
    currency VARCHAR(3) NOT NULL,
    precision SMALLINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_write_off_amount_positive CHECK (amount > 0)
);

CREATE TABLE inactive_administrative_costs (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    transfer_id BIGINT NOT NULL UNIQUE REFERENCES transfers(id),
    amount BIGINT NOT NULL,
    currency VARCHAR(3) NOT NULL,
    precision SMALLINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_inactivity_cost_amount_positive CHECK (amount > 0)
);
";

const TRIGGERS_SQL: &str = r"
-- ============================================================
-- FUNCTION: prevent_ledger_mutation
-- Transfers are append-only. Mistakes are corrected with an
-- offsetting transfer, never by editing history.
-- ============================================================
CREATE OR REPLACE FUNCTION prevent_ledger_mutation()
RETURNS TRIGGER AS $$
BEGIN
    RAISE EXCEPTION 'Ledger table % is append-only', TG_TABLE_NAME
        USING ERRCODE = 'P0001';
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_transfers_append_only
BEFORE UPDATE OR DELETE ON transfers
FOR EACH ROW
EXECUTE FUNCTION prevent_ledger_mutation();
";

const DROP_SQL: &str = r"
DROP TABLE IF EXISTS inactive_administrative_costs CASCADE;
DROP TABLE IF EXISTS write_offs CASCADE;
DROP TABLE IF EXISTS fines CASCADE;
ALTER TABLE IF EXISTS users DROP CONSTRAINT IF EXISTS fk_users_current_fines;
DROP TABLE IF EXISTS user_fine_groups CASCADE;
DROP TABLE IF EXISTS balances CASCADE;
DROP TABLE IF EXISTS sub_transaction_rows CASCADE;
DROP TABLE IF EXISTS sub_transactions CASCADE;
DROP TABLE IF EXISTS transactions CASCADE;
DROP TABLE IF EXISTS transfers CASCADE;
DROP FUNCTION IF EXISTS prevent_ledger_mutation() CASCADE;
DROP TABLE IF EXISTS users CASCADE;
";
