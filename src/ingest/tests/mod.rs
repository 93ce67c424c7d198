mod helpers;

mod tests_ack;
