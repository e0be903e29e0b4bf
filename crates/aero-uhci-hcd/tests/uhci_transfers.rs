use std::sync::Arc;

use aero_uhci_hcd::{EndpointInfo, PipeListener, Request, RequestStatus, SkeletonQueue, UsbError};

mod util;

use util::{
    get_descriptor, set_address, Bench, RecordingListener, DEVICE_DESCRIPTOR, EP_BULK_IN,
    EP_BULK_OUT, EP_INTERRUPT_IN,
};

fn bulk_out() -> EndpointInfo {
    EndpointInfo::from_descriptor(EP_BULK_OUT, 0x02, 64, 0)
}

fn bulk_in() -> EndpointInfo {
    EndpointInfo::from_descriptor(0x80 | EP_BULK_IN, 0x02, 64, 0)
}

#[test]
fn get_descriptor_round_trip() {
    let bench = Bench::new();
    let ep0 = bench.control_pipe(0);
    assert_eq!(ep0.skeleton(), SkeletonQueue::HighSpeedControl);

    let req = Arc::new(Request::control(get_descriptor(18), vec![0; 18]));
    ep0.submit(&req).unwrap();
    bench.run_frames(3);

    assert!(req.is_completed());
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 18);
    assert_eq!(req.data(), DEVICE_DESCRIPTOR.to_vec());
    assert!(!ep0.has_active_request());
    assert!(ep0.queue_head().is_empty());
}

#[test]
fn short_control_read_still_runs_the_status_stage() {
    let bench = Bench::new();
    let ep0 = bench.control_pipe(0);

    let req = Arc::new(Request::control(get_descriptor(64), vec![0; 64]));
    ep0.submit(&req).unwrap();
    bench.run_frames(4);

    assert!(req.is_completed());
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 18);
    assert_eq!(&req.data()[..18], &DEVICE_DESCRIPTOR);
}

#[test]
fn set_address_moves_the_device() {
    let bench = Bench::new();
    let ep0 = bench.control_pipe(0);

    let req = Arc::new(Request::control(set_address(5), Vec::new()));
    ep0.submit(&req).unwrap();
    bench.run_frames(2);
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 0);
    assert_eq!(bench.device.lock().address, 5);

    // Nobody answers on address 0 any more.
    let stale = Arc::new(Request::control(get_descriptor(8), vec![0; 8]));
    ep0.submit(&stale).unwrap();
    bench.run_frames(2);
    assert_eq!(stale.status(), RequestStatus::CRC_TIMEOUT);

    let ep0 = bench.control_pipe(5);
    let req = Arc::new(Request::control(get_descriptor(8), vec![0; 8]));
    ep0.submit(&req).unwrap();
    bench.run_frames(2);
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.data(), DEVICE_DESCRIPTOR[..8].to_vec());
}

#[test]
fn stalled_setup_fails_the_request() {
    let bench = Bench::new();
    let ep0 = bench.control_pipe(0);
    let listener = Arc::new(RecordingListener::default());
    ep0.add_listener(listener.clone());

    bench.device.lock().stalled_endpoint = Some(0);
    let req = Arc::new(Request::control(get_descriptor(18), vec![0; 18]));
    ep0.submit(&req).unwrap();
    bench.run_frames(2);

    assert!(req.is_completed());
    assert_eq!(req.status(), RequestStatus::STALLED);
    assert_eq!(listener.events(), vec![(false, Vec::new())]);
}

#[test]
fn low_speed_control_uses_its_own_queue() {
    let bench = Bench::with_speed(true);
    let ep0 = bench.control_pipe(0);
    assert_eq!(ep0.skeleton(), SkeletonQueue::LowSpeedControl);

    let req = Arc::new(Request::control(get_descriptor(18), vec![0; 18]));
    ep0.submit(&req).unwrap();
    bench.run_frames(2);
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.data(), DEVICE_DESCRIPTOR.to_vec());
}

#[test]
fn bulk_out_splits_into_packets_and_tracks_the_toggle() {
    let bench = Bench::new();
    let pipe = bench.endpoint_pipe(0, bulk_out());
    assert_eq!(pipe.skeleton(), SkeletonQueue::Bulk);

    let payload: Vec<u8> = (0..150u32).map(|i| i as u8).collect();
    let req = Arc::new(Request::transfer(payload.clone()));
    pipe.submit(&req).unwrap();
    bench.run_frames(2);

    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 150);
    assert_eq!(bench.device.lock().bulk_out, payload);
    // DATA0, DATA1, DATA0 went out; DATA1 is next.
    assert!(pipe.data_toggle());
}

#[test]
fn bulk_in_completes_on_a_short_packet() {
    let bench = Bench::new();
    let pipe = bench.endpoint_pipe(0, bulk_in());

    let req = Arc::new(Request::transfer(vec![0; 128]));
    pipe.submit(&req).unwrap();
    bench.run_frames(4);
    assert!(!req.is_completed(), "endpoint NAKs while empty");
    assert!(pipe.has_active_request());

    let sent: Vec<u8> = (0..100u32).map(|i| (i * 3) as u8).collect();
    bench.device.lock().bulk_in.extend(sent.iter().copied());
    bench.run_frames(2);

    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 100);
    assert_eq!(&req.data()[..100], &sent[..]);
    assert!(!pipe.data_toggle());
}

#[test]
fn queued_requests_complete_in_submission_order() {
    let bench = Bench::new();
    let pipe = bench.endpoint_pipe(0, bulk_out());
    let listener = Arc::new(RecordingListener::default());
    pipe.add_listener(listener.clone());

    let first = Arc::new(Request::transfer(vec![1; 10]));
    let second = Arc::new(Request::transfer(vec![2; 10]));
    pipe.submit(&first).unwrap();
    pipe.submit(&second).unwrap();
    assert_eq!(pipe.queued_requests(), 1);

    bench.run_frames(3);
    assert!(first.is_completed());
    assert!(second.is_completed());
    assert_eq!(pipe.queued_requests(), 0);

    let mut expected = vec![1; 10];
    expected.extend_from_slice(&[2; 10]);
    assert_eq!(bench.device.lock().bulk_out, expected);
    assert_eq!(
        listener.events(),
        vec![(true, vec![1; 10]), (true, vec![2; 10])]
    );
}

#[test]
fn stalled_bulk_endpoint_recovers_after_the_stall_clears() {
    let bench = Bench::new();
    let pipe = bench.endpoint_pipe(0, bulk_out());
    let listener = Arc::new(RecordingListener::default());
    pipe.add_listener(listener.clone());

    bench.device.lock().stalled_endpoint = Some(EP_BULK_OUT);
    let req = Arc::new(Request::transfer(vec![7; 100]));
    pipe.submit(&req).unwrap();
    bench.run_frames(2);
    assert_eq!(req.status(), RequestStatus::STALLED);
    assert_eq!(req.actual_length(), 0);
    // The failed first packet was DATA0, so the endpoint resumes with DATA0.
    assert!(!pipe.data_toggle());

    bench.device.lock().stalled_endpoint = None;
    pipe.submit(&req).unwrap();
    bench.run_frames(2);
    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(bench.device.lock().bulk_out, vec![7; 100]);

    let events = listener.events();
    assert_eq!(events.len(), 2);
    assert!(!events[0].0);
    assert!(events[1].0);
}

#[test]
fn interrupt_pipe_polls_until_reports_arrive_and_re_arms() {
    let bench = Bench::new();
    let ep = EndpointInfo::from_descriptor(0x80 | EP_INTERRUPT_IN, 0x03, 8, 1);
    let pipe = bench.endpoint_pipe(0, ep);
    assert_eq!(pipe.skeleton(), SkeletonQueue::Interrupt(0));
    let listener = Arc::new(RecordingListener::default());
    pipe.add_listener(listener.clone());

    let req = Arc::new(Request::transfer(vec![0; 8]));
    pipe.submit(&req).unwrap();
    bench.run_frames(5);
    assert!(listener.events().is_empty());

    bench.device.lock().reports.push_back(vec![1, 2, 3, 4]);
    bench.run_frames(2);
    assert_eq!(listener.events(), vec![(true, vec![1, 2, 3, 4])]);
    // Re-armed straight away.
    assert!(pipe.has_active_request());
    assert!(!req.is_completed());

    bench.device.lock().reports.push_back(vec![9; 8]);
    bench.run_frames(2);
    assert_eq!(
        listener.events(),
        vec![(true, vec![1, 2, 3, 4]), (true, vec![9; 8])]
    );

    let dyn_listener: Arc<dyn PipeListener> = listener.clone();
    pipe.remove_listener(&dyn_listener);
    bench.device.lock().reports.push_back(vec![5; 8]);
    bench.run_frames(2);
    assert_eq!(listener.events().len(), 2);
}

#[test]
fn isochronous_out_runs_once() {
    let bench = Bench::new();
    let ep = EndpointInfo::from_descriptor(EP_BULK_OUT, 0x01, 64, 1);
    let pipe = bench.endpoint_pipe(0, ep);
    assert_eq!(pipe.skeleton(), SkeletonQueue::Interrupt(0));

    let req = Arc::new(Request::transfer(vec![0x5A; 100]));
    pipe.submit(&req).unwrap();
    bench.run_frames(3);

    assert_eq!(req.status(), RequestStatus::COMPLETED);
    assert_eq!(req.actual_length(), 100);
    assert!(!pipe.has_active_request());
    assert_eq!(bench.device.lock().bulk_out, vec![0x5A; 100]);
}

#[test]
fn closed_pipes_reject_submissions() {
    let bench = Bench::new();
    let pipe = bench.endpoint_pipe(0, bulk_out());
    pipe.close();
    assert!(!pipe.is_open());
    assert_eq!(bench.hc.pipe_manager().open_pipe_count(), 0);

    let req = Arc::new(Request::transfer(vec![1; 4]));
    assert_eq!(pipe.submit(&req), Err(UsbError::NotOpen));
}
