diesel::table! {
    bookings (id) {
        id -> Uuid,
        user_id -> Uuid,
        total_amount -> Numeric,
        slot_date -> Date,
        slot_time -> Varchar,
        payment_status -> Varchar,
        status -> Varchar,
        partner_booking_id -> Nullable<Varchar>,
        partner_error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    partner_retries (booking_id) {
        booking_id -> Uuid,
        attempts -> Int4,
        max_attempts -> Int4,
        next_retry_at -> Timestamptz,
        last_error -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reconciler_leases (name) {
        name -> Varchar,
        holder -> Varchar,
        expires_at -> Timestamptz,
    }
}

diesel::joinable!(partner_retries -> bookings (booking_id));

diesel::allow_tables_to_appear_in_same_query!(bookings, partner_retries);
