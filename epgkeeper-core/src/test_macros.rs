macro_rules! channel {
    ($client_id:expr, $channel_uid:expr) => {
        $crate::models::EpgChannelData::new(
            $client_id.into(),
            $channel_uid.into(),
            format!("ch{}", $channel_uid),
        )
    };
}

macro_rules! tag {
    ($id:expr, $channel:expr, $start_at:expr, $end_at:expr) => {
        $crate::models::EpgTag::new($id.into(), $channel.into(), $start_at, $end_at)
    };
    ($id:expr, $start_at:expr, $end_at:expr) => {
        tag!($id, (1, 100), $start_at, $end_at)
    };
}
